//! Minimal executable graph for one operator invocation.

use std::fmt;

use smallvec::SmallVec;

use crate::backend::spec::{DType, DeviceContext, DeviceLayout, DeviceTarget, TensorSpec};
use crate::error::BuildError;
use crate::ops::{AbstractValue, InputRole, OpInvocation, Primitive, ATTR_DYNAMIC_SHAPE};
use crate::tensor::Value;

/// Operators whose inferred output shapes cannot be trusted until they have run.
pub const INVALID_INFER_RESULT_OPS: [&str; 3] = ["Dropout", "MaxPoolWithArgmax", "LSTM"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Graph input bound at launch time.
    Placeholder {
        position: usize,
        spec: TensorSpec,
        layout: Option<DeviceLayout>,
        /// Concrete backing value kept for parameter-role inputs.
        default: Option<Value>,
    },
    Constant {
        position: usize,
        value: Value,
    },
    Compute {
        primitive: Primitive,
        inputs: Vec<NodeId>,
    },
    TupleGetItem {
        source: NodeId,
        index: usize,
    },
    MakeTuple {
        inputs: Vec<NodeId>,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub stream_id: u32,
}

/// Metadata of one public output position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    /// Producing node and its output index.
    pub source: (NodeId, usize),
    pub tensor_count: usize,
    pub layout: DeviceLayout,
    pub dtype: Option<DType>,
}

/// Placeholder inputs, one computation node and the public output projection.
#[derive(Debug, Clone)]
pub struct SingleOpGraph {
    nodes: Vec<Node>,
    placeholders: Vec<NodeId>,
    compute: NodeId,
    output: NodeId,
    outputs: Vec<OutputInfo>,
    declared_output: AbstractValue,
    device: DeviceContext,
    need_refresh_shape: bool,
}

impl SingleOpGraph {
    /// Builds the graph for `invocation` without touching device memory.
    pub fn build(invocation: &OpInvocation) -> Result<Self, BuildError> {
        let _scope = crate::profiling::compile_scope("compile::build_graph");
        let op = invocation.op_name();
        let inputs = invocation.inputs();
        let roles = invocation.roles();
        if inputs.len() != roles.len() {
            return Err(BuildError::RoleCountMismatch {
                op: op.to_string(),
                values: inputs.len(),
                roles: roles.len(),
            });
        }
        if let Some(expected) = invocation.primitive().input_count() {
            if expected != inputs.len() {
                return Err(BuildError::ArityMismatch {
                    op: op.to_string(),
                    expected,
                    actual: inputs.len(),
                });
            }
        }

        let device = invocation.device_context();
        let stream_id = invocation.stream_id();
        let mut builder = NodeBuilder::new(stream_id);
        let mut placeholders = Vec::new();
        let mut operand_nodes = Vec::with_capacity(inputs.len());

        for (position, (value, role)) in inputs.iter().zip(roles).enumerate() {
            let kind = match *role {
                InputRole::Constant => NodeKind::Constant {
                    position,
                    value: value.clone(),
                },
                InputRole::Parameter | InputRole::OpOutput => {
                    let tensor = value.as_tensor().ok_or_else(|| BuildError::NonTensorPlaceholder {
                        op: op.to_string(),
                        position,
                        kind: value.kind(),
                    })?;
                    // Layouts only carry over for buffers that already live on the target.
                    let layout = if tensor.device() == device.target {
                        tensor.layout().cloned()
                    } else {
                        None
                    };
                    NodeKind::Placeholder {
                        position,
                        spec: tensor.spec().clone(),
                        layout,
                        default: (*role == InputRole::Parameter).then(|| value.clone()),
                    }
                }
                InputRole::Unknown(code) => {
                    return Err(BuildError::UnknownRole {
                        op: op.to_string(),
                        position,
                        code,
                    })
                }
            };
            let id = builder.push(kind);
            if matches!(*role, InputRole::Parameter | InputRole::OpOutput) {
                placeholders.push(id);
            }
            operand_nodes.push(id);
        }

        let mut primitive = invocation.primitive().clone();
        if invocation.use_dynamic_shape() {
            primitive.set_attr(ATTR_DYNAMIC_SHAPE, true);
        }
        let compute = builder.push(NodeKind::Compute {
            primitive,
            inputs: operand_nodes,
        });

        let declared = invocation.output().clone();
        let layout = output_layout(&builder.nodes, &placeholders, device.target);
        let (output, outputs) = project_outputs(&mut builder, compute, &declared, layout);

        let need_refresh_shape = declared.is_dynamic() || INVALID_INFER_RESULT_OPS.contains(&op);

        Ok(Self {
            nodes: builder.nodes,
            placeholders,
            compute,
            output,
            outputs,
            declared_output: declared,
            device,
            need_refresh_shape,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn placeholders(&self) -> &[NodeId] {
        &self.placeholders
    }

    pub fn compute_node(&self) -> &Node {
        self.node(self.compute)
    }

    /// The operator copy held by the computation node.
    pub fn primitive(&self) -> &Primitive {
        match &self.compute_node().kind {
            NodeKind::Compute { primitive, .. } => primitive,
            _ => unreachable!("compute id always names a compute node"),
        }
    }

    pub fn output_node(&self) -> NodeId {
        self.output
    }

    pub fn outputs(&self) -> &[OutputInfo] {
        &self.outputs
    }

    pub fn declared_output(&self) -> &AbstractValue {
        &self.declared_output
    }

    pub fn device(&self) -> DeviceContext {
        self.device
    }

    pub fn need_refresh_shape(&self) -> bool {
        self.need_refresh_shape
    }

    /// Invocation inputs that feed placeholders, in placeholder order. Constants are already
    /// embedded in the graph and are dropped.
    pub fn bind_inputs(&self, inputs: &[Value]) -> Vec<Value> {
        self.placeholders
            .iter()
            .filter_map(|id| match &self.node(*id).kind {
                NodeKind::Placeholder { position, .. } => inputs.get(*position).cloned(),
                _ => None,
            })
            .collect()
    }
}

struct NodeBuilder {
    nodes: Vec<Node>,
    stream_id: u32,
}

impl NodeBuilder {
    fn new(stream_id: u32) -> Self {
        Self {
            nodes: Vec::new(),
            stream_id,
        }
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            kind,
            stream_id: self.stream_id,
        });
        id
    }
}

/// Output node and per-position metadata. Arity > 1 projects each position through
/// `TupleGetItem` into a public `MakeTuple`; arity 1 exposes the compute node itself.
fn project_outputs(
    builder: &mut NodeBuilder,
    compute: NodeId,
    declared: &AbstractValue,
    layout: DeviceLayout,
) -> (NodeId, Vec<OutputInfo>) {
    let positions = declared.positions();
    let outputs: Vec<OutputInfo> = positions
        .iter()
        .enumerate()
        .map(|(index, position)| OutputInfo {
            source: (compute, index),
            tensor_count: position.tensor_count(),
            layout: layout.clone(),
            dtype: position.dtype(),
        })
        .collect();
    if positions.len() <= 1 {
        return (compute, outputs);
    }
    let projections: SmallVec<[NodeId; 4]> = (0..positions.len())
        .map(|index| {
            builder.push(NodeKind::TupleGetItem {
                source: compute,
                index,
            })
        })
        .collect();
    let tuple = builder.push(NodeKind::MakeTuple {
        inputs: projections.into_vec(),
    });
    (tuple, outputs)
}

/// Ascend kernels keep the layout of their first formatted input; other targets use the default.
fn output_layout(nodes: &[Node], placeholders: &[NodeId], target: DeviceTarget) -> DeviceLayout {
    if target != DeviceTarget::Ascend {
        return DeviceLayout::default();
    }
    placeholders
        .iter()
        .find_map(|id| match &nodes[id.0 as usize].kind {
            NodeKind::Placeholder {
                layout: Some(layout),
                ..
            } => Some(layout.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{Dimension, Shape};
    use crate::ops::AttrValue;
    use crate::tensor::{Scalar, Tensor};

    fn spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(DType::F32, Shape::from_static(dims))
    }

    fn ones(dims: &[usize]) -> Tensor {
        let count: usize = dims.iter().product();
        Tensor::from_f32(dims, &vec![1.0; count])
    }

    #[test]
    fn single_output_wraps_compute_node() {
        let weight = ones(&[3]);
        let invocation = OpInvocation::new(
            Primitive::new("BiasAdd"),
            AbstractValue::Tensor(spec(&[2, 3])),
            DeviceTarget::Gpu,
        )
        .with_input(ones(&[2, 3]), InputRole::OpOutput)
        .with_input(weight.clone(), InputRole::Parameter)
        .with_input(Value::Scalar(Scalar::Int(1)), InputRole::Constant)
        .with_stream(2);
        let graph = SingleOpGraph::build(&invocation).expect("build");

        assert_eq!(graph.nodes().len(), 4);
        assert_eq!(graph.placeholders().len(), 2);
        assert_eq!(graph.output_node(), graph.compute_node().id);
        assert_eq!(graph.outputs().len(), 1);
        assert!(graph.nodes().iter().all(|node| node.stream_id == 2));
        match &graph.node(graph.placeholders()[1]).kind {
            NodeKind::Placeholder {
                default: Some(Value::Tensor(default)),
                ..
            } => assert!(default.ptr_eq(&weight)),
            other => panic!("unexpected node {other:?}"),
        }
        assert_eq!(graph.bind_inputs(invocation.inputs()).len(), 2);
        assert!(!graph.need_refresh_shape());
    }

    #[test]
    fn tuple_output_gets_projection_nodes() {
        let output = AbstractValue::Tuple(vec![
            AbstractValue::Tensor(spec(&[2])),
            AbstractValue::Tensor(TensorSpec::new(DType::I32, Shape::from_static(&[2]))),
        ]);
        let invocation = OpInvocation::new(Primitive::new("TopK"), output, DeviceTarget::Gpu)
            .with_input(ones(&[4]), InputRole::OpOutput);
        let graph = SingleOpGraph::build(&invocation).expect("build");

        let compute = graph.compute_node().id;
        assert!(matches!(
            graph.node(graph.output_node()).kind,
            NodeKind::MakeTuple { ref inputs } if inputs.len() == 2
        ));
        assert_eq!(graph.outputs()[1].source, (compute, 1));
        assert_eq!(graph.outputs()[1].dtype, Some(DType::I32));
    }

    #[test]
    fn dynamic_outputs_and_unreliable_ops_need_refresh() {
        let dynamic = AbstractValue::Tensor(TensorSpec::new(
            DType::F32,
            Shape::new(vec![Dimension::Dynamic]),
        ));
        let invocation = OpInvocation::new(Primitive::new("Unique"), dynamic, DeviceTarget::Gpu)
            .with_input(ones(&[4]), InputRole::OpOutput);
        let graph = SingleOpGraph::build(&invocation).expect("build");
        assert!(graph.need_refresh_shape());
        assert_eq!(
            graph.primitive().attr(ATTR_DYNAMIC_SHAPE),
            Some(&AttrValue::Bool(true))
        );

        let invocation = OpInvocation::new(
            Primitive::new("Dropout"),
            AbstractValue::Tensor(spec(&[4])),
            DeviceTarget::Gpu,
        )
        .with_input(ones(&[4]), InputRole::OpOutput);
        assert!(SingleOpGraph::build(&invocation).expect("build").need_refresh_shape());
    }

    #[test]
    fn compute_node_snapshots_the_primitive() {
        let mut primitive = Primitive::new("Scale").with_attr("factor", 2.0);
        let invocation =
            OpInvocation::new(primitive.clone(), AbstractValue::Tensor(spec(&[2])), DeviceTarget::Gpu)
                .with_input(ones(&[2]), InputRole::OpOutput);
        let graph = SingleOpGraph::build(&invocation).expect("build");
        primitive.set_attr("factor", 3.0);
        assert_eq!(graph.primitive().attr("factor"), Some(&AttrValue::Float(2.0)));
    }

    #[test]
    fn malformed_invocations_are_rejected() {
        let out = AbstractValue::Tensor(spec(&[2]));
        let arity = OpInvocation::new(
            Primitive::new("Add").with_input_count(2),
            out.clone(),
            DeviceTarget::Gpu,
        )
        .with_input(ones(&[2]), InputRole::OpOutput);
        assert!(matches!(
            SingleOpGraph::build(&arity),
            Err(BuildError::ArityMismatch { expected: 2, actual: 1, .. })
        ));

        let role = OpInvocation::new(Primitive::new("Neg"), out.clone(), DeviceTarget::Gpu)
            .with_input(ones(&[2]), InputRole::from_code(9));
        assert!(matches!(
            SingleOpGraph::build(&role),
            Err(BuildError::UnknownRole { position: 0, code: 9, .. })
        ));

        let counts = OpInvocation::from_parts(
            Primitive::new("Neg"),
            vec![ones(&[2]).into()],
            Vec::new(),
            out.clone(),
            DeviceTarget::Gpu,
        );
        assert!(matches!(
            SingleOpGraph::build(&counts),
            Err(BuildError::RoleCountMismatch { values: 1, roles: 0, .. })
        ));

        let scalar = OpInvocation::new(Primitive::new("Neg"), out, DeviceTarget::Gpu)
            .with_input(Value::Scalar(Scalar::Int(1)), InputRole::OpOutput);
        assert!(matches!(
            SingleOpGraph::build(&scalar),
            Err(BuildError::NonTensorPlaceholder { kind: "scalar", .. })
        ));
    }
}
