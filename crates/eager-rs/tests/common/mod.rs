#![allow(dead_code)]

use std::sync::Arc;

use eager_rs::{AbstractValue, DType, DeviceTarget, EagerRuntime, RuntimeConfig, Shape, TensorSpec};
use eager_rs_backend_ref::{RefAllocator, RefExecutor};

pub fn f32_spec(shape: &[usize]) -> TensorSpec {
    TensorSpec::new(DType::F32, Shape::from_static(shape))
}

pub fn f32_out(shape: &[usize]) -> AbstractValue {
    AbstractValue::Tensor(f32_spec(shape))
}

pub fn ref_executor() -> Arc<RefExecutor> {
    Arc::new(RefExecutor::new(Arc::new(RefAllocator::new())))
}

pub fn runtime_with(config: RuntimeConfig) -> (Arc<RefExecutor>, EagerRuntime<RefExecutor>) {
    let executor = ref_executor();
    let runtime = EagerRuntime::new(Arc::clone(&executor), executor.device_allocator(), config);
    (executor, runtime)
}

/// Runtime building kernels on the background thread.
pub fn runtime() -> (Arc<RefExecutor>, EagerRuntime<RefExecutor>) {
    runtime_with(RuntimeConfig::default())
}

pub const GPU: DeviceTarget = DeviceTarget::Gpu;
