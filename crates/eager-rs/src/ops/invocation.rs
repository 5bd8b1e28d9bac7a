use std::collections::BTreeSet;
use std::fmt;

use smallvec::SmallVec;

use super::primitive::{AttrValue, Primitive, ATTR_PRIMITIVE_TARGET};
use crate::backend::spec::{DType, DeviceContext, DeviceTarget, TensorSpec};
use crate::tensor::Value;

/// Declared output of an operator or subgraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbstractValue {
    Tensor(TensorSpec),
    Tuple(Vec<AbstractValue>),
}

impl AbstractValue {
    /// Number of output positions: tuple length, or one for a single tensor.
    pub fn arity(&self) -> usize {
        match self {
            AbstractValue::Tensor(_) => 1,
            AbstractValue::Tuple(items) => items.len(),
        }
    }

    /// Per-position descriptions, in order.
    pub fn positions(&self) -> SmallVec<[&AbstractValue; 4]> {
        match self {
            AbstractValue::Tensor(_) => smallvec::smallvec![self],
            AbstractValue::Tuple(items) => items.iter().collect(),
        }
    }

    pub fn tensor_count(&self) -> usize {
        match self {
            AbstractValue::Tensor(_) => 1,
            AbstractValue::Tuple(items) => items.iter().map(AbstractValue::tensor_count).sum(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        match self {
            AbstractValue::Tensor(spec) => spec.shape.is_dynamic(),
            AbstractValue::Tuple(items) => items.iter().any(AbstractValue::is_dynamic),
        }
    }

    /// Element type of the first tensor leaf.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            AbstractValue::Tensor(spec) => Some(spec.dtype),
            AbstractValue::Tuple(items) => items.iter().find_map(AbstractValue::dtype),
        }
    }

    /// Whether `value` has this structure and these tensor specs.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (AbstractValue::Tensor(spec), Value::Tensor(tensor)) => tensor.spec() == spec,
            (AbstractValue::Tuple(items), Value::Tuple(values)) => {
                items.len() == values.len()
                    && items
                        .iter()
                        .zip(values.iter())
                        .all(|(item, value)| item.matches(value))
            }
            _ => false,
        }
    }
}

/// How an input value enters the compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputRole {
    /// Embedded in the graph as an immutable literal.
    Constant,
    /// Graph input whose concrete value is kept as the placeholder default (weights).
    Parameter,
    /// Graph input fed by a previous operation or the caller (data).
    OpOutput,
    /// Role code not understood by the runtime; rejected when the graph is built.
    Unknown(i32),
}

impl InputRole {
    pub const DATA_CODE: i32 = 0;
    pub const WEIGHT_CODE: i32 = 1;
    pub const CONSTANT_CODE: i32 = 2;

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::DATA_CODE => InputRole::OpOutput,
            Self::WEIGHT_CODE => InputRole::Parameter,
            Self::CONSTANT_CODE => InputRole::Constant,
            other => InputRole::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            InputRole::OpOutput => Self::DATA_CODE,
            InputRole::Parameter => Self::WEIGHT_CODE,
            InputRole::Constant => Self::CONSTANT_CODE,
            InputRole::Unknown(code) => code,
        }
    }
}

/// One call of an operator on concrete inputs.
#[derive(Debug, Clone)]
pub struct OpInvocation {
    primitive: Primitive,
    inputs: Vec<Value>,
    roles: Vec<InputRole>,
    output: AbstractValue,
    device: DeviceTarget,
    device_id: u32,
    stream_id: u32,
    use_dynamic_shape: bool,
    /// Per original operand: number of expanded inputs it became, `-1` for a plain operand.
    dyn_input_sizes: Vec<i64>,
}

impl OpInvocation {
    /// Invocation with no inputs yet. Declared dynamic outputs select the dynamic-shape path.
    pub fn new(primitive: Primitive, output: AbstractValue, device: DeviceTarget) -> Self {
        let use_dynamic_shape = output.is_dynamic();
        Self {
            primitive,
            inputs: Vec::new(),
            roles: Vec::new(),
            output,
            device,
            device_id: 0,
            stream_id: 0,
            use_dynamic_shape,
            dyn_input_sizes: Vec::new(),
        }
    }

    /// Invocation from parallel value/role lists; length mismatches surface when it is compiled.
    pub fn from_parts(
        primitive: Primitive,
        inputs: Vec<Value>,
        roles: Vec<InputRole>,
        output: AbstractValue,
        device: DeviceTarget,
    ) -> Self {
        let mut invocation = Self::new(primitive, output, device);
        invocation.inputs = inputs;
        invocation.roles = roles;
        invocation
    }

    pub fn with_input(mut self, value: impl Into<Value>, role: InputRole) -> Self {
        self.inputs.push(value.into());
        self.roles.push(role);
        self
    }

    pub fn with_stream(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_dynamic_shape(mut self, enabled: bool) -> Self {
        self.use_dynamic_shape = enabled;
        self
    }

    pub fn with_dyn_input_sizes(mut self, sizes: Vec<i64>) -> Self {
        self.dyn_input_sizes = sizes;
        self
    }

    pub fn primitive(&self) -> &Primitive {
        &self.primitive
    }

    pub fn op_name(&self) -> &str {
        self.primitive.name()
    }

    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    pub fn roles(&self) -> &[InputRole] {
        &self.roles
    }

    pub fn output(&self) -> &AbstractValue {
        &self.output
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn use_dynamic_shape(&self) -> bool {
        self.use_dynamic_shape
    }

    pub fn dyn_input_sizes(&self) -> &[i64] {
        &self.dyn_input_sizes
    }

    pub fn need_erase_cache(&self) -> bool {
        self.primitive.erase_cache()
    }

    /// Device family the operator runs on; a `primitive_target` attribute overrides the caller's.
    pub fn target(&self) -> DeviceTarget {
        match self.primitive.attr(ATTR_PRIMITIVE_TARGET) {
            Some(AttrValue::Str(name)) => match name.parse() {
                Ok(target) => target,
                Err(err) => {
                    tracing::warn!(op = self.op_name(), %err, "ignoring primitive target override");
                    self.device
                }
            },
            _ => self.device,
        }
    }

    pub fn device_context(&self) -> DeviceContext {
        DeviceContext::new(self.target(), self.device_id)
    }

    /// Expanded input positions whose values steer kernel selection.
    pub fn value_depend_positions(&self) -> BTreeSet<usize> {
        let declared = self.primitive.value_depend();
        if self.dyn_input_sizes.is_empty() {
            return declared.clone();
        }
        declared
            .iter()
            .map(|&operand| {
                (0..operand)
                    .map(|index| match self.dyn_input_sizes.get(index) {
                        Some(&size) if size >= 0 => size as usize,
                        _ => 1,
                    })
                    .sum::<usize>()
            })
            .collect()
    }
}

impl fmt::Display for OpInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.op_name())?;
        for (index, value) in self.inputs.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ") on {}", self.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::Shape;

    fn f32_output(dims: &[usize]) -> AbstractValue {
        AbstractValue::Tensor(TensorSpec::new(DType::F32, Shape::from_static(dims)))
    }

    #[test]
    fn value_depend_positions_follow_dynamic_input_groups() {
        let primitive = Primitive::new("Concat").with_value_depend(2);
        let invocation = OpInvocation::new(primitive, f32_output(&[4]), DeviceTarget::Gpu)
            .with_dyn_input_sizes(vec![3, -1, -1]);
        assert_eq!(
            invocation.value_depend_positions().into_iter().collect::<Vec<_>>(),
            vec![4]
        );
    }

    #[test]
    fn primitive_target_overrides_device() {
        let primitive = Primitive::new("Print").with_attr(ATTR_PRIMITIVE_TARGET, "CPU");
        let invocation = OpInvocation::new(primitive, f32_output(&[1]), DeviceTarget::Ascend);
        assert_eq!(invocation.target(), DeviceTarget::Cpu);
    }

    #[test]
    fn role_codes_round_trip_known_values() {
        for role in [InputRole::OpOutput, InputRole::Parameter, InputRole::Constant] {
            assert_eq!(InputRole::from_code(role.code()), role);
        }
        assert_eq!(InputRole::from_code(7), InputRole::Unknown(7));
    }
}
