use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::compile::SingleOpGraph;
use crate::tensor::Value;

/// Scalar element types understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I8,
    U8,
    I16,
    I32,
    I64,
    F16,
    Bf16,
    F32,
    F64,
}

impl DType {
    /// Stable numeric id written into cache keys.
    pub fn type_id(self) -> u32 {
        match self {
            DType::Bool => 30,
            DType::I8 => 32,
            DType::I16 => 33,
            DType::I32 => 34,
            DType::I64 => 35,
            DType::U8 => 37,
            DType::F16 => 42,
            DType::F32 => 43,
            DType::F64 => 44,
            DType::Bf16 => 46,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::F16 | DType::Bf16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }
}

/// Single tensor extent; `Dynamic` is only known after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims
            .iter()
            .any(|dim| matches!(dim, Dimension::Dynamic))
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|dim| match dim {
                Dimension::Static(value) => Some(*value),
                Dimension::Dynamic => None,
            })
            .collect()
    }

    pub fn element_count(&self) -> Option<usize> {
        self.static_dims()?
            .into_iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(dim))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, dim) in self.dims.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            match dim {
                Dimension::Static(value) => write!(f, "{value}")?,
                Dimension::Dynamic => f.write_str("-1")?,
            }
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

/// Device family a unit is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceTarget {
    Cpu,
    Gpu,
    Ascend,
}

impl DeviceTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceTarget::Cpu => "CPU",
            DeviceTarget::Gpu => "GPU",
            DeviceTarget::Ascend => "Ascend",
        }
    }

    /// Host and device memory coincide, so forward outputs need no separate staging release.
    pub fn shares_host_memory(self) -> bool {
        matches!(self, DeviceTarget::Cpu)
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceTarget {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceTarget::Cpu),
            "gpu" | "cuda" => Ok(DeviceTarget::Gpu),
            "ascend" | "npu" => Ok(DeviceTarget::Ascend),
            other => Err(BackendError::unsupported_device(other)),
        }
    }
}

/// Device a unit is bound to: target family plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceContext {
    pub target: DeviceTarget,
    pub device_id: u32,
}

impl DeviceContext {
    pub fn new(target: DeviceTarget, device_id: u32) -> Self {
        Self { target, device_id }
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target, self.device_id)
    }
}

/// Memory layout metadata attached to a device-resident buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceLayout {
    pub format: String,
    /// Reshape/padding tag used when the device format pads lower-rank tensors.
    #[serde(default)]
    pub padding: String,
}

impl DeviceLayout {
    pub const DEFAULT_FORMAT: &'static str = "DefaultFormat";

    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            padding: String::new(),
        }
    }

    pub fn with_padding(mut self, padding: impl Into<String>) -> Self {
        self.padding = padding.into();
        self
    }
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FORMAT)
    }
}

/// Opaque device allocation returned by an [`Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub id: u64,
    pub size: usize,
}

/// Device memory provider.
pub trait Allocator: Send + Sync {
    fn alloc(&self, size: usize) -> BackendResult<DeviceHandle>;

    /// Returns `handle` to the pool. Each handle is freed at most once by the runtime.
    fn free(&self, handle: DeviceHandle);

    /// Copies the contents of `handle` back to the host. Cache keys use it for value-steering
    /// device inputs.
    fn read(&self, handle: DeviceHandle) -> BackendResult<Vec<u8>> {
        Err(BackendError::unimplemented(
            "read",
            format!("allocator cannot read back buffer {}", handle.id),
        ))
    }
}

/// Kernel creation and launch for compiled single-operator graphs.
pub trait Executor: Send + Sync + 'static {
    type Kernel: Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`, `"cuda"`).
    fn backend_name(&self) -> &str;

    /// Materializes a runnable kernel for `graph`.
    ///
    /// Runs at most once per compiled unit, possibly on the builder thread. Memory requested from
    /// `allocator` is owned by the unit on success and freed again if the build fails.
    fn create_kernel(
        &self,
        graph: &SingleOpGraph,
        allocator: &dyn Allocator,
    ) -> BackendResult<Self::Kernel>;

    /// Runs `kernel` on the placeholder inputs of its graph, in placeholder order.
    ///
    /// Returns one value per output position of the graph.
    fn launch(&self, kernel: &Self::Kernel, inputs: &[Value]) -> BackendResult<Vec<Value>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unimplemented { op: String, reason: String },
    Allocation { size: usize, message: String },
    UnsupportedDevice { name: String },
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn allocation(size: usize, message: impl Into<String>) -> Self {
        BackendError::Allocation {
            size,
            message: message.into(),
        }
    }

    pub fn unsupported_device(name: impl Into<String>) -> Self {
        BackendError::UnsupportedDevice { name: name.into() }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Allocation { size, message } => {
                write!(f, "failed to allocate {size} bytes: {message}")
            }
            BackendError::UnsupportedDevice { name } => {
                write!(f, "unsupported device target `{name}`")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;
