use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eager_rs::backend::spec::{
    Allocator, BackendError, BackendResult, DType, DeviceTarget, Executor, Shape, TensorSpec,
};
use eager_rs::compile::{NodeKind, SingleOpGraph};
use eager_rs::ops::AbstractValue;
use eager_rs::tensor::{DeviceStorage, Tensor, Value};

use crate::allocator::RefAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefOp {
    Add,
    Sub,
    Mul,
    Neg,
    Relu,
    /// Copies its input into fresh storage.
    Copy,
    /// Returns its input tensor object unchanged.
    Identity,
    /// Returns its input object at two output positions.
    Dup,
    /// Returns all its inputs as one tuple value.
    Pack,
}

impl RefOp {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "Add" => RefOp::Add,
            "Sub" => RefOp::Sub,
            "Mul" => RefOp::Mul,
            "Neg" => RefOp::Neg,
            "Relu" | "ReLU" => RefOp::Relu,
            "Copy" => RefOp::Copy,
            "Identity" => RefOp::Identity,
            "Dup" => RefOp::Dup,
            "Pack" => RefOp::Pack,
            _ => return None,
        })
    }

    fn input_count(self) -> usize {
        match self {
            RefOp::Add | RefOp::Sub | RefOp::Mul => 2,
            _ => 1,
        }
    }
}

/// Kernel for one compiled unit: the operator, its embedded constants and declared output specs.
#[derive(Debug, Clone)]
pub struct RefKernel {
    op: RefOp,
    name: String,
    device: DeviceTarget,
    /// Per operator input: the constant baked into the graph, or `None` for a placeholder.
    operands: Vec<Option<Value>>,
    outputs: Vec<Option<TensorSpec>>,
}

impl RefKernel {
    pub fn op_name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceTarget {
        self.device
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildFault {
    Error,
    Panic,
}

/// Host executor over [`RefAllocator`] memory.
///
/// Tests can inject kernel build failures, slow builds and per-kernel workspace allocations.
pub struct RefExecutor {
    allocator: Arc<RefAllocator>,
    device_allocator: Arc<dyn Allocator>,
    faults: Mutex<Vec<(String, BuildFault)>>,
    build_delay: Mutex<Option<Duration>>,
    workspace_bytes: AtomicUsize,
    kernels_created: AtomicUsize,
    launches: Mutex<Vec<String>>,
}

impl RefExecutor {
    pub fn new(allocator: Arc<RefAllocator>) -> Self {
        let device_allocator: Arc<dyn Allocator> = allocator.clone();
        Self {
            allocator,
            device_allocator,
            faults: Mutex::new(Vec::new()),
            build_delay: Mutex::new(None),
            workspace_bytes: AtomicUsize::new(0),
            kernels_created: AtomicUsize::new(0),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn allocator(&self) -> &Arc<RefAllocator> {
        &self.allocator
    }

    /// The same pool as [`allocator`](Self::allocator), as the runtime consumes it.
    pub fn device_allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.device_allocator)
    }

    /// Kernel creation for `op` returns an error after allocating its workspace.
    pub fn fail_kernel(&self, op: &str) {
        self.push_fault(op, BuildFault::Error);
    }

    /// Kernel creation for `op` panics after allocating its workspace.
    pub fn panic_kernel(&self, op: &str) {
        self.push_fault(op, BuildFault::Panic);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().expect("ref executor poisoned").clear();
    }

    pub fn set_build_delay(&self, delay: Option<Duration>) {
        *self.build_delay.lock().expect("ref executor poisoned") = delay;
    }

    /// Bytes of workspace requested from the build allocator for every kernel.
    pub fn set_workspace_bytes(&self, bytes: usize) {
        self.workspace_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn kernels_created(&self) -> usize {
        self.kernels_created.load(Ordering::Relaxed)
    }

    /// Operator names in launch order.
    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().expect("ref executor poisoned").clone()
    }

    /// Copies `values` into a fresh allocation and wraps it as a device tensor.
    pub fn upload(
        &self,
        device: DeviceTarget,
        shape: &[usize],
        values: &[f32],
    ) -> BackendResult<Tensor> {
        let spec = TensorSpec::new(DType::F32, Shape::from_static(shape));
        self.store(spec, device, values)
    }

    pub fn download(&self, tensor: &Tensor) -> BackendResult<Vec<f32>> {
        if tensor.spec().dtype != DType::F32 {
            return Err(BackendError::unimplemented(
                "download",
                format!("dtype {:?}", tensor.spec().dtype),
            ));
        }
        if let Some(values) = tensor.as_f32() {
            return Ok(values);
        }
        let handle = tensor
            .device_handle()
            .ok_or_else(|| BackendError::execution(format!("tensor {} has no storage", tensor.id())))?;
        let bytes = self.allocator.read(handle)?;
        let len = tensor
            .spec()
            .byte_len()
            .unwrap_or(bytes.len())
            .min(bytes.len());
        Ok(decode_f32(&bytes[..len]))
    }

    fn push_fault(&self, op: &str, fault: BuildFault) {
        self.faults
            .lock()
            .expect("ref executor poisoned")
            .push((op.to_string(), fault));
    }

    fn fault_for(&self, op: &str) -> Option<BuildFault> {
        self.faults
            .lock()
            .expect("ref executor poisoned")
            .iter()
            .find(|(name, _)| name == op)
            .map(|(_, fault)| *fault)
    }

    fn store(&self, spec: TensorSpec, device: DeviceTarget, values: &[f32]) -> BackendResult<Tensor> {
        let bytes = encode_f32(values);
        let storage = DeviceStorage::allocate(&self.device_allocator, bytes.len())?;
        if let Some(handle) = storage.handle() {
            self.allocator.write(handle, &bytes)?;
        }
        Ok(Tensor::on_device(spec, device, storage))
    }

    /// Interleaves launch inputs with the kernel's constants, in operator input order.
    fn operands(&self, kernel: &RefKernel, inputs: &[Value]) -> Vec<Value> {
        let mut launched = inputs.iter();
        let mut operands: Vec<Value> = kernel
            .operands
            .iter()
            .filter_map(|slot| match slot {
                Some(constant) => Some(constant.clone()),
                None => launched.next().cloned(),
            })
            .collect();
        operands.extend(launched.cloned());
        operands
    }

    fn operand(&self, kernel: &RefKernel, inputs: &[Value], index: usize) -> BackendResult<Tensor> {
        inputs
            .get(index)
            .and_then(Value::as_tensor)
            .cloned()
            .ok_or_else(|| {
                BackendError::execution(format!(
                    "{} expects a tensor at input {index}",
                    kernel.name
                ))
            })
    }

    /// Declared spec when it describes `len` elements, otherwise the spec of the first input.
    fn output_spec(
        &self,
        kernel: &RefKernel,
        position: usize,
        len: usize,
        fallback: &TensorSpec,
    ) -> TensorSpec {
        match kernel.outputs.get(position) {
            Some(Some(spec)) if spec.shape.element_count() == Some(len) => spec.clone(),
            _ => fallback.clone(),
        }
    }
}

impl Executor for RefExecutor {
    type Kernel = RefKernel;

    fn backend_name(&self) -> &str {
        "ref"
    }

    fn create_kernel(
        &self,
        graph: &SingleOpGraph,
        allocator: &dyn Allocator,
    ) -> BackendResult<Self::Kernel> {
        let name = graph.primitive().name().to_string();
        tracing::debug!(op = %name, device = %graph.device(), "creating ref kernel");
        let delay = *self.build_delay.lock().expect("ref executor poisoned");
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let workspace = self.workspace_bytes.load(Ordering::Relaxed);
        if workspace > 0 {
            allocator.alloc(workspace)?;
        }

        match self.fault_for(&name) {
            Some(BuildFault::Error) => {
                return Err(BackendError::unimplemented(&name, "injected build failure"))
            }
            Some(BuildFault::Panic) => panic!("injected kernel build panic for {name}"),
            None => {}
        }

        let op = RefOp::parse(&name)
            .ok_or_else(|| BackendError::unimplemented(&name, "no reference kernel"))?;
        let operands = match &graph.compute_node().kind {
            NodeKind::Compute { inputs, .. } => inputs
                .iter()
                .map(|id| match &graph.node(*id).kind {
                    NodeKind::Constant { value, .. } => Some(value.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        let outputs = graph
            .declared_output()
            .positions()
            .into_iter()
            .map(|position| match position {
                AbstractValue::Tensor(spec) => Some(spec.clone()),
                AbstractValue::Tuple(_) => None,
            })
            .collect();

        self.kernels_created.fetch_add(1, Ordering::Relaxed);
        Ok(RefKernel {
            op,
            name,
            device: graph.device().target,
            operands,
            outputs,
        })
    }

    fn launch(&self, kernel: &Self::Kernel, inputs: &[Value]) -> BackendResult<Vec<Value>> {
        let inputs = self.operands(kernel, inputs);
        let inputs = inputs.as_slice();
        if inputs.len() < kernel.op.input_count() {
            return Err(BackendError::execution(format!(
                "{} expects {} inputs, got {}",
                kernel.name,
                kernel.op.input_count(),
                inputs.len()
            )));
        }
        self.launches
            .lock()
            .expect("ref executor poisoned")
            .push(kernel.name.clone());

        let first = self.operand(kernel, inputs, 0)?;
        match kernel.op {
            RefOp::Identity => return Ok(vec![Value::Tensor(first)]),
            RefOp::Dup => return Ok(vec![Value::Tensor(first.clone()), Value::Tensor(first)]),
            RefOp::Pack => return Ok(vec![Value::tuple(inputs.to_vec())]),
            _ => {}
        }

        let lhs = self.download(&first)?;
        let values: Vec<f32> = match kernel.op {
            RefOp::Neg => lhs.iter().map(|value| -value).collect(),
            RefOp::Relu => lhs.iter().map(|value| value.max(0.0)).collect(),
            RefOp::Copy => lhs,
            RefOp::Add | RefOp::Sub | RefOp::Mul => {
                let rhs = self.download(&self.operand(kernel, inputs, 1)?)?;
                binary(kernel, &lhs, &rhs)?
            }
            RefOp::Identity | RefOp::Dup | RefOp::Pack => unreachable!("handled above"),
        };

        let spec = self.output_spec(kernel, 0, values.len(), first.spec());
        let output = self.store(spec, kernel.device, &values)?;
        Ok(vec![Value::Tensor(output)])
    }
}

/// Elementwise binary op; a single-element operand broadcasts.
fn binary(kernel: &RefKernel, lhs: &[f32], rhs: &[f32]) -> BackendResult<Vec<f32>> {
    let apply = |a: f32, b: f32| match kernel.op {
        RefOp::Add => a + b,
        RefOp::Sub => a - b,
        _ => a * b,
    };
    match (lhs.len(), rhs.len()) {
        (l, r) if l == r => Ok(lhs.iter().zip(rhs).map(|(a, b)| apply(*a, *b)).collect()),
        (_, 1) => Ok(lhs.iter().map(|a| apply(*a, rhs[0])).collect()),
        (1, _) => Ok(rhs.iter().map(|b| apply(lhs[0], *b)).collect()),
        (l, r) => Err(BackendError::execution(format!(
            "{} operand lengths differ: {l} vs {r}",
            kernel.name
        ))),
    }
}

fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
