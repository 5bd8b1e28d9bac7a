//! Kernel creation for freshly compiled units, inline or on a background thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::cache::{CompilationCache, CompiledUnit, ReadyKernel};
use crate::backend::spec::{Allocator, BackendResult, DeviceHandle, Executor};
use crate::tensor::DeviceStorage;

/// Allocator handed to `create_kernel`; remembers every live allocation of one build.
struct ScopedAllocator {
    inner: Arc<dyn Allocator>,
    live: Mutex<Vec<DeviceHandle>>,
}

impl ScopedAllocator {
    fn new(inner: Arc<dyn Allocator>) -> Self {
        Self {
            inner,
            live: Mutex::new(Vec::new()),
        }
    }

    fn take_live(&self) -> Vec<DeviceHandle> {
        std::mem::take(&mut *self.live.lock().expect("build scope poisoned"))
    }

    /// Hands the surviving allocations to the unit.
    fn commit(self) -> Vec<DeviceStorage> {
        self.take_live()
            .into_iter()
            .map(|handle| DeviceStorage::new(handle, Arc::clone(&self.inner)))
            .collect()
    }

    fn rollback(self) -> usize {
        let live = self.take_live();
        let count = live.len();
        for handle in live {
            self.inner.free(handle);
        }
        count
    }
}

impl Allocator for ScopedAllocator {
    fn alloc(&self, size: usize) -> BackendResult<DeviceHandle> {
        let handle = self.inner.alloc(size)?;
        self.live.lock().expect("build scope poisoned").push(handle);
        Ok(handle)
    }

    fn free(&self, handle: DeviceHandle) {
        let mut live = self.live.lock().expect("build scope poisoned");
        if let Some(index) = live.iter().position(|candidate| *candidate == handle) {
            live.swap_remove(index);
        }
        drop(live);
        self.inner.free(handle);
    }
}

impl Drop for ScopedAllocator {
    fn drop(&mut self) {
        let live = match self.live.get_mut() {
            Ok(live) => std::mem::take(live),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for handle in live {
            self.inner.free(handle);
        }
    }
}

/// Creates the kernel for `unit` and settles its readiness.
///
/// On failure every allocation made during the build is freed, the unit is evicted if the cache
/// still maps its key to it, and only then marked failed.
pub(crate) fn build_kernel<E: Executor>(
    executor: &E,
    allocator: &Arc<dyn Allocator>,
    cache: &CompilationCache<E::Kernel>,
    unit: &Arc<CompiledUnit<E::Kernel>>,
) {
    let _scope = crate::profiling::compile_scope("compile::create_kernel");
    let scope = ScopedAllocator::new(Arc::clone(allocator));
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        executor.create_kernel(unit.graph(), &scope)
    }));
    let message = match outcome {
        Ok(Ok(kernel)) => {
            let workspace = scope.commit();
            if unit.install_kernel(ReadyKernel { kernel, workspace }) {
                tracing::debug!(
                    op = unit.op_name(),
                    graph_id = unit.graph_id(),
                    backend = executor.backend_name(),
                    "kernel ready"
                );
            }
            return;
        }
        Ok(Err(err)) => err.to_string(),
        Err(_) => "kernel creation panicked".to_string(),
    };
    let freed = scope.rollback();
    tracing::warn!(
        op = unit.op_name(),
        key = %unit.key(),
        freed,
        error = %message,
        "kernel build failed"
    );
    // Evict before settling so waiters never observe a failed unit that is still cached.
    cache.evict_unit(unit);
    unit.fail(message);
}

struct BuildJob<K> {
    unit: Arc<CompiledUnit<K>>,
}

/// Runs kernel builds either on the caller's thread or on a dedicated builder thread.
pub(crate) struct KernelBuilder<E: Executor> {
    executor: Arc<E>,
    allocator: Arc<dyn Allocator>,
    cache: Arc<CompilationCache<E::Kernel>>,
    queue: Option<Sender<BuildJob<E::Kernel>>>,
    worker: Option<JoinHandle<()>>,
}

impl<E: Executor> KernelBuilder<E> {
    pub(crate) fn new(
        executor: Arc<E>,
        allocator: Arc<dyn Allocator>,
        cache: Arc<CompilationCache<E::Kernel>>,
        background: bool,
    ) -> Self {
        let mut builder = Self {
            executor,
            allocator,
            cache,
            queue: None,
            worker: None,
        };
        if background {
            builder.spawn_worker();
        }
        builder
    }

    fn spawn_worker(&mut self) {
        let (sender, receiver) = mpsc::channel::<BuildJob<E::Kernel>>();
        let executor = Arc::clone(&self.executor);
        let allocator = Arc::clone(&self.allocator);
        let cache = Arc::clone(&self.cache);
        let spawned = std::thread::Builder::new()
            .name("eager-kernel-builder".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    build_kernel(executor.as_ref(), &allocator, &cache, &job.unit);
                }
            });
        match spawned {
            Ok(handle) => {
                self.queue = Some(sender);
                self.worker = Some(handle);
            }
            Err(err) => {
                tracing::warn!(%err, "builder thread unavailable, building kernels inline");
            }
        }
    }

    /// Schedules kernel creation for a newly inserted unit.
    pub(crate) fn submit(&self, unit: Arc<CompiledUnit<E::Kernel>>) {
        if let Some(queue) = &self.queue {
            match queue.send(BuildJob { unit }) {
                Ok(()) => return,
                Err(mpsc::SendError(job)) => {
                    tracing::warn!("builder thread gone, building kernel inline");
                    build_kernel(self.executor.as_ref(), &self.allocator, &self.cache, &job.unit);
                }
            }
        } else {
            build_kernel(self.executor.as_ref(), &self.allocator, &self.cache, &unit);
        }
    }
}

impl<E: Executor> Drop for KernelBuilder<E> {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain pending jobs and exit.
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("kernel builder thread panicked");
            }
        }
    }
}
