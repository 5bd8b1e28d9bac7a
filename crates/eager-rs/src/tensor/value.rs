use std::fmt;
use std::sync::Arc;

use super::Tensor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(value) => write!(f, "{value}"),
            Scalar::Int(value) => write!(f, "{value}"),
            // Debug keeps a trailing `.0` so `1` and `1.0` render differently.
            Scalar::Float(value) => write!(f, "{value:?}"),
        }
    }
}

/// Runtime value flowing through invocations and subgraphs.
///
/// Tuples hold their elements behind an `Arc`, so cloning a value never duplicates the object:
/// [`Value::same_object`] is pointer identity for tensors and tuples.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    Scalar(Scalar),
    Str(String),
    Tuple(Arc<[Value]>),
    None,
}

impl Value {
    pub fn tuple(values: Vec<Value>) -> Self {
        Value::Tuple(values.into())
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(values) => Some(values),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Scalar(_) => "scalar",
            Value::Str(_) => "string",
            Value::Tuple(_) => "tuple",
            Value::None => "none",
        }
    }

    pub fn same_object(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => a.ptr_eq(b),
            (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b),
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::None, Value::None) => true,
            _ => false,
        }
    }

    /// Visits every tensor leaf in depth-first order.
    pub fn for_each_tensor<'a>(&'a self, visit: &mut impl FnMut(&'a Tensor)) {
        match self {
            Value::Tensor(tensor) => visit(tensor),
            Value::Tuple(values) => {
                for value in values.iter() {
                    value.for_each_tensor(visit);
                }
            }
            Value::Scalar(_) | Value::Str(_) | Value::None => {}
        }
    }

    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.for_each_tensor(&mut |tensor| out.push(tensor));
        out
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        Value::Scalar(scalar)
    }
}

/// Generic string form, also the fallback encoding for cache keys.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(tensor) => write!(f, "{tensor}"),
            Value::Scalar(scalar) => write!(f, "{scalar}"),
            Value::Str(text) => write!(f, "{text:?}"),
            Value::Tuple(values) => {
                f.write_str("(")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str(")")
            }
            Value::None => f.write_str("None"),
        }
    }
}
