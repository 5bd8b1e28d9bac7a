//! Shared tensor handles and the storage guards that back them.

mod value;

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::spec::{
    Allocator, BackendError, BackendResult, DeviceHandle, DeviceLayout, DeviceTarget, Shape,
    TensorSpec,
};

pub use value::{Scalar, Value};

static TENSOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a tensor object, stable across subgraphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Owned device allocation.
///
/// The handle sits in an `Option` and is taken out exactly once, either by [`DeviceStorage::release`]
/// or on drop, so a handle can never reach [`Allocator::free`] twice.
pub struct DeviceStorage {
    handle: Mutex<Option<DeviceHandle>>,
    allocator: Arc<dyn Allocator>,
}

impl DeviceStorage {
    pub fn new(handle: DeviceHandle, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
            allocator,
        }
    }

    /// Allocates `size` bytes from `allocator` and wraps the handle.
    pub fn allocate(
        allocator: &Arc<dyn Allocator>,
        size: usize,
    ) -> BackendResult<Arc<Self>> {
        let handle = allocator.alloc(size)?;
        Ok(Arc::new(Self::new(handle, Arc::clone(allocator))))
    }

    /// Live handle, or `None` once released.
    pub fn handle(&self) -> Option<DeviceHandle> {
        *self.handle.lock().expect("device storage poisoned")
    }

    pub fn is_released(&self) -> bool {
        self.handle().is_none()
    }

    /// Copies the allocation back to the host through the owning allocator.
    pub fn read(&self) -> BackendResult<Vec<u8>> {
        let handle = self
            .handle()
            .ok_or_else(|| BackendError::execution("read of released device storage"))?;
        self.allocator.read(handle)
    }

    /// Frees the handle; returns `false` when it was already released.
    pub fn release(&self) -> bool {
        let taken = self.handle.lock().expect("device storage poisoned").take();
        match taken {
            Some(handle) => {
                self.allocator.free(handle);
                true
            }
            None => false,
        }
    }
}

impl Drop for DeviceStorage {
    fn drop(&mut self) {
        let taken = match self.handle.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = taken {
            self.allocator.free(handle);
        }
    }
}

impl fmt::Debug for DeviceStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStorage")
            .field("handle", &self.handle())
            .finish()
    }
}

struct TensorInner {
    id: TensorId,
    spec: TensorSpec,
    device: DeviceTarget,
    layout: Option<DeviceLayout>,
    /// Shape carried by tensors whose extents are only partly known.
    base_shape: Option<Shape>,
    host: Option<Arc<[u8]>>,
    storage: Mutex<Option<Arc<DeviceStorage>>>,
    forward_output: AtomicBool,
}

/// Cheaply clonable tensor handle. Clones refer to the same tensor object.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl Tensor {
    fn from_parts(spec: TensorSpec, device: DeviceTarget) -> TensorInner {
        TensorInner {
            id: TensorId(TENSOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)),
            spec,
            device,
            layout: None,
            base_shape: None,
            host: None,
            storage: Mutex::new(None),
            forward_output: AtomicBool::new(false),
        }
    }

    /// Tensor backed by device memory.
    pub fn on_device(spec: TensorSpec, device: DeviceTarget, storage: Arc<DeviceStorage>) -> Self {
        let inner = Self::from_parts(spec, device);
        *inner.storage.lock().expect("tensor storage poisoned") = Some(storage);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Host-resident tensor holding its bytes directly.
    pub fn from_host(spec: TensorSpec, bytes: impl Into<Arc<[u8]>>) -> Self {
        let mut inner = Self::from_parts(spec, DeviceTarget::Cpu);
        inner.host = Some(bytes.into());
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_f32(shape: &[usize], values: &[f32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_le_bytes()).collect();
        Self::from_host(
            TensorSpec::new(crate::backend::spec::DType::F32, Shape::from_static(shape)),
            bytes,
        )
    }

    /// Builder-style layout tag. On an already shared handle this yields a new tensor object that
    /// shares the storage.
    pub fn with_layout(self, layout: DeviceLayout) -> Self {
        self.map_unique(|inner| inner.layout = Some(layout))
    }

    pub fn with_base_shape(self, shape: Shape) -> Self {
        self.map_unique(|inner| inner.base_shape = Some(shape))
    }

    fn map_unique(self, update: impl FnOnce(&mut TensorInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                update(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                let current = shared.storage.lock().expect("tensor storage poisoned").clone();
                let mut inner = TensorInner {
                    id: TensorId(TENSOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)),
                    spec: shared.spec.clone(),
                    device: shared.device,
                    layout: shared.layout.clone(),
                    base_shape: shared.base_shape.clone(),
                    host: shared.host.clone(),
                    storage: Mutex::new(current),
                    forward_output: AtomicBool::new(shared.forward_output.load(Ordering::Acquire)),
                };
                update(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
        }
    }

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.inner.spec
    }

    pub fn device(&self) -> DeviceTarget {
        self.inner.device
    }

    pub fn layout(&self) -> Option<&DeviceLayout> {
        self.inner.layout.as_ref()
    }

    pub fn base_shape(&self) -> Option<&Shape> {
        self.inner.base_shape.as_ref()
    }

    pub fn host_bytes(&self) -> Option<&[u8]> {
        self.inner.host.as_deref()
    }

    pub fn storage(&self) -> Option<Arc<DeviceStorage>> {
        self.inner
            .storage
            .lock()
            .expect("tensor storage poisoned")
            .clone()
    }

    pub fn device_handle(&self) -> Option<DeviceHandle> {
        self.storage().and_then(|storage| storage.handle())
    }

    /// Frees the backing allocation now, regardless of other holders of the storage.
    pub fn release_storage(&self) -> bool {
        let storage = self
            .inner
            .storage
            .lock()
            .expect("tensor storage poisoned")
            .take();
        storage.is_some_and(|storage| storage.release())
    }

    /// Detaches the storage from this tensor; it is reclaimed once no other owner holds it.
    pub fn clear_device_storage(&self) -> bool {
        self.inner
            .storage
            .lock()
            .expect("tensor storage poisoned")
            .take()
            .is_some()
    }

    pub fn mark_forward_output(&self) {
        self.inner.forward_output.store(true, Ordering::Release);
    }

    pub fn is_forward_output(&self) -> bool {
        self.inner.forward_output.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tensor contents on the host: the host bytes, or a readback of the device storage trimmed
    /// to the spec's byte length.
    pub fn read_bytes(&self) -> BackendResult<Vec<u8>> {
        if let Some(bytes) = self.host_bytes() {
            return Ok(bytes.to_vec());
        }
        let storage = self
            .storage()
            .ok_or_else(|| BackendError::execution(format!("tensor {} has no storage", self.id())))?;
        let mut bytes = storage.read()?;
        if let Some(len) = self.spec().byte_len() {
            bytes.truncate(len);
        }
        Ok(bytes)
    }

    /// Canonical string of the tensor contents for cache keys: the bytes in hex.
    ///
    /// Equal contents give equal strings wherever the tensor lives. A tensor whose contents cannot
    /// be read falls back to `#` and its identity, which never aliases another tensor.
    pub fn value_string(&self) -> String {
        match self.read_bytes() {
            Ok(bytes) => {
                let mut out = String::with_capacity(bytes.len() * 2);
                for byte in &bytes {
                    let _ = write!(out, "{byte:02x}");
                }
                out
            }
            Err(err) => {
                tracing::debug!(tensor = %self.id(), %err, "keying tensor by identity");
                format!("#{}", self.id())
            }
        }
    }

    pub fn as_f32(&self) -> Option<Vec<f32>> {
        if self.spec().dtype != crate::backend::spec::DType::F32 {
            return None;
        }
        let bytes = self.host_bytes()?;
        Some(
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

/// Key identifying a shared allocation, used to detect aliasing between tensors.
pub(crate) fn storage_key(storage: &Arc<DeviceStorage>) -> usize {
    Arc::as_ptr(storage) as usize
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id())
            .field("spec", self.spec())
            .field("device", &self.device())
            .field("handle", &self.device_handle())
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor({}, {:?}{})",
            self.id(),
            self.spec().dtype,
            self.spec().shape
        )
    }
}
