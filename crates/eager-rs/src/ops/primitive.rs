use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Attribute tagging a compute node compiled for the dynamic-shape path.
pub const ATTR_DYNAMIC_SHAPE: &str = "is_dynamic_shape";
/// Attribute that pins an operator to a device family other than the caller's.
pub const ATTR_PRIMITIVE_TARGET: &str = "primitive_target";

static PRIMITIVE_INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(value) => write!(f, "{value}"),
            AttrValue::Int(value) => write!(f, "{value}"),
            AttrValue::Float(value) => write!(f, "{value:?}"),
            AttrValue::Str(value) => f.write_str(value),
            AttrValue::Ints(values) => {
                f.write_str("(")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(values: Vec<i64>) -> Self {
        AttrValue::Ints(values)
    }
}

/// Operator descriptor.
///
/// Each `Primitive::new` call creates a new instance id; clones share it. Operators with hidden
/// side effects use the id to keep their cache entries apart.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    name: String,
    attrs: BTreeMap<String, AttrValue>,
    instance_id: u64,
    hidden_side_effect: bool,
    erase_cache: bool,
    /// Original operand positions whose values steer kernel selection.
    value_depend: BTreeSet<usize>,
    input_count: Option<usize>,
}

impl Primitive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
            instance_id: PRIMITIVE_INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed),
            hidden_side_effect: false,
            erase_cache: false,
            value_depend: BTreeSet::new(),
            input_count: None,
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_hidden_side_effect(mut self) -> Self {
        self.hidden_side_effect = true;
        self
    }

    /// Units compiled for this operator are dropped from the cache after each run.
    pub fn with_erase_cache(mut self) -> Self {
        self.erase_cache = true;
        self
    }

    pub fn with_value_depend(mut self, position: usize) -> Self {
        self.value_depend.insert(position);
        self
    }

    pub fn with_input_count(mut self, count: usize) -> Self {
        self.input_count = Some(count);
        self
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Attributes in name order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attrs.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn has_hidden_side_effect(&self) -> bool {
        self.hidden_side_effect
    }

    pub fn erase_cache(&self) -> bool {
        self.erase_cache
    }

    pub fn value_depend(&self) -> &BTreeSet<usize> {
        &self.value_depend
    }

    pub fn input_count(&self) -> Option<usize> {
        self.input_count
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
