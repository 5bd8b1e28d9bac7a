//! Interpreted subgraphs: an ordered list of operations threading values between them.

use std::fmt;

use crate::backend::spec::DeviceTarget;
use crate::ops::{AbstractValue, InputRole, Primitive};
use crate::tensor::Value;

/// A produced value: (producing operation, output position).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueRef {
    pub op: usize,
    pub output: usize,
}

impl ValueRef {
    pub fn new(op: usize, output: usize) -> Self {
        Self { op, output }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}.{}", self.op, self.output)
    }
}

/// Where an operation input, or the subgraph output, comes from.
#[derive(Debug, Clone)]
pub enum Operand {
    /// Caller-supplied subgraph input.
    Input(usize),
    Constant(Value),
    /// Output of an earlier operation.
    Output(ValueRef),
    /// Gathers operands into a tuple; consumers see through it to the leaves.
    MakeTuple(Vec<Operand>),
}

impl Operand {
    pub fn output(op: usize, output: usize) -> Self {
        Operand::Output(ValueRef::new(op, output))
    }

    /// Visits every operation output referenced by this operand, once per edge.
    pub fn for_each_ref(&self, visit: &mut impl FnMut(ValueRef)) {
        match self {
            Operand::Output(value) => visit(*value),
            Operand::MakeTuple(items) => {
                for item in items {
                    item.for_each_ref(visit);
                }
            }
            Operand::Input(_) | Operand::Constant(_) => {}
        }
    }

    /// Visits every subgraph input referenced by this operand, once per edge.
    pub fn for_each_input(&self, visit: &mut impl FnMut(usize)) {
        match self {
            Operand::Input(index) => visit(*index),
            Operand::MakeTuple(items) => {
                for item in items {
                    item.for_each_input(visit);
                }
            }
            Operand::Output(_) | Operand::Constant(_) => {}
        }
    }

    /// Visits every embedded constant, once per edge.
    pub fn for_each_constant<'s>(&'s self, visit: &mut impl FnMut(&'s Value)) {
        match self {
            Operand::Constant(value) => visit(value),
            Operand::MakeTuple(items) => {
                for item in items {
                    item.for_each_constant(visit);
                }
            }
            Operand::Input(_) | Operand::Output(_) => {}
        }
    }
}

impl From<ValueRef> for Operand {
    fn from(value: ValueRef) -> Self {
        Operand::Output(value)
    }
}

#[derive(Debug, Clone)]
pub struct SubgraphOp {
    pub primitive: Primitive,
    pub operands: Vec<Operand>,
    pub output: AbstractValue,
    pub stream_id: u32,
}

/// Operations executed in order on one device, plus the declared (possibly nested) output.
#[derive(Debug, Clone)]
pub struct Subgraph {
    device: DeviceTarget,
    device_id: u32,
    dynamic_shape: bool,
    input_roles: Vec<InputRole>,
    ops: Vec<SubgraphOp>,
    output: Operand,
}

impl Subgraph {
    pub fn new(device: DeviceTarget) -> Self {
        Self {
            device,
            device_id: 0,
            dynamic_shape: false,
            input_roles: Vec::new(),
            ops: Vec::new(),
            output: Operand::MakeTuple(Vec::new()),
        }
    }

    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Compile every operation on the dynamic-shape path.
    pub fn with_dynamic_shape(mut self, enabled: bool) -> Self {
        self.dynamic_shape = enabled;
        self
    }

    /// Declares the next subgraph input; `role` is `Parameter` for weights, `OpOutput` for data.
    pub fn add_input(&mut self, role: InputRole) -> Operand {
        self.input_roles.push(role);
        Operand::Input(self.input_roles.len() - 1)
    }

    /// Appends an operation and returns a reference to its first output.
    pub fn push(
        &mut self,
        primitive: Primitive,
        operands: Vec<Operand>,
        output: AbstractValue,
    ) -> ValueRef {
        self.push_on_stream(primitive, operands, output, 0)
    }

    pub fn push_on_stream(
        &mut self,
        primitive: Primitive,
        operands: Vec<Operand>,
        output: AbstractValue,
        stream_id: u32,
    ) -> ValueRef {
        self.ops.push(SubgraphOp {
            primitive,
            operands,
            output,
            stream_id,
        });
        ValueRef::new(self.ops.len() - 1, 0)
    }

    pub fn set_output(&mut self, output: impl Into<Operand>) {
        self.output = output.into();
    }

    pub fn device(&self) -> DeviceTarget {
        self.device
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn dynamic_shape(&self) -> bool {
        self.dynamic_shape
    }

    pub fn input_roles(&self) -> &[InputRole] {
        &self.input_roles
    }

    pub fn ops(&self) -> &[SubgraphOp] {
        &self.ops
    }

    pub fn output(&self) -> &Operand {
        &self.output
    }

    /// Number of (consumer, input) edges that point at operation outputs.
    pub fn output_edge_count(&self) -> usize {
        let mut edges = 0;
        for op in &self.ops {
            for operand in &op.operands {
                operand.for_each_ref(&mut |_| edges += 1);
            }
        }
        edges
    }
}
