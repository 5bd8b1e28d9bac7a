//! Compilation cache keyed by invocation fingerprint.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use lru::LruCache;

use super::fingerprint::{fingerprint, CacheKey};
use super::graph::{OutputInfo, SingleOpGraph};
use super::ready::{Readiness, ReadySignal};
use crate::backend::spec::DeviceContext;
use crate::error::CompileError;
use crate::ops::OpInvocation;
use crate::tensor::DeviceStorage;

static GRAPH_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Kernel plus the device memory it claimed while being created.
pub struct ReadyKernel<K> {
    pub kernel: K,
    /// Freed when the unit is dropped.
    pub workspace: Vec<DeviceStorage>,
}

/// Built single-operator graph and, once ready, its kernel.
///
/// Everything except the kernel slot and the readiness signal is fixed at construction; the unit
/// is published into the cache only after it is complete.
pub struct CompiledUnit<K> {
    key: CacheKey,
    graph_id: u64,
    graph: SingleOpGraph,
    op_name: String,
    use_dynamic_shape: bool,
    erase_after_run: bool,
    kernel: OnceLock<ReadyKernel<K>>,
    ready: ReadySignal,
}

impl<K> CompiledUnit<K> {
    pub(crate) fn new(key: CacheKey, invocation: &OpInvocation, graph: SingleOpGraph) -> Self {
        Self {
            key,
            graph_id: GRAPH_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            graph,
            op_name: invocation.op_name().to_string(),
            use_dynamic_shape: invocation.use_dynamic_shape(),
            erase_after_run: invocation.need_erase_cache(),
            kernel: OnceLock::new(),
            ready: ReadySignal::new(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    pub fn graph(&self) -> &SingleOpGraph {
        &self.graph
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    pub fn device(&self) -> DeviceContext {
        self.graph.device()
    }

    pub fn outputs(&self) -> &[OutputInfo] {
        self.graph.outputs()
    }

    pub fn need_refresh_shape(&self) -> bool {
        self.graph.need_refresh_shape()
    }

    pub fn use_dynamic_shape(&self) -> bool {
        self.use_dynamic_shape
    }

    pub fn erase_after_run(&self) -> bool {
        self.erase_after_run
    }

    pub fn readiness(&self) -> Readiness {
        self.ready.state()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    /// Kernel, once the unit is ready.
    pub fn kernel(&self) -> Option<&K> {
        if self.is_ready() {
            self.kernel.get().map(|ready| &ready.kernel)
        } else {
            None
        }
    }

    /// Blocks until the kernel is built; spins `spin_limit` times before sleeping.
    pub fn wait_ready(&self, spin_limit: usize) -> Result<&K, CompileError> {
        self.ready
            .wait(spin_limit)
            .map_err(|message| self.kernel_error(message))?;
        self.kernel
            .get()
            .map(|ready| &ready.kernel)
            .ok_or_else(|| self.kernel_error("ready unit has no kernel".to_string()))
    }

    /// Installs the kernel and flips readiness. A second install is rejected.
    pub(crate) fn install_kernel(&self, kernel: ReadyKernel<K>) -> bool {
        if self.kernel.set(kernel).is_err() {
            return false;
        }
        self.ready.set_ready()
    }

    pub(crate) fn fail(&self, message: impl Into<String>) -> bool {
        self.ready.set_failed(message)
    }

    fn kernel_error(&self, message: String) -> CompileError {
        CompileError::KernelBuild {
            op: self.op_name.clone(),
            key: self.key.to_string(),
            message,
        }
    }
}

impl<K> fmt::Debug for CompiledUnit<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("key", &self.key)
            .field("graph_id", &self.graph_id)
            .field("device", &self.device())
            .field("readiness", &self.readiness())
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Mapping from [`CacheKey`] to [`CompiledUnit`].
///
/// Lookups and inserts share one lock; graphs are built outside it and published with
/// insert-if-absent, so readers never see a partially built unit.
pub struct CompilationCache<K> {
    entries: Mutex<LruCache<CacheKey, Arc<CompiledUnit<K>>>>,
    stats: StatCounters,
}

impl<K> CompilationCache<K> {
    /// `None` keeps units until they are evicted explicitly.
    pub fn new(capacity: Option<usize>) -> Self {
        let entries = match capacity.and_then(NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            stats: StatCounters::default(),
        }
    }

    /// Returns the cached unit for `invocation`, building it on a miss.
    ///
    /// The flag is `true` for a hit, whether or not the unit is ready yet. Build failures leave
    /// the cache untouched.
    #[tracing::instrument(skip_all, fields(op = invocation.op_name()))]
    pub fn get_or_build(
        &self,
        invocation: &OpInvocation,
    ) -> Result<(Arc<CompiledUnit<K>>, bool), CompileError> {
        let key = fingerprint(invocation);
        if let Some(unit) = self.lookup(&key) {
            self.record_hit(&key);
            return Ok((unit, true));
        }

        tracing::debug!(key = %key, digest = key.digest(), "compile cache miss");
        let graph = SingleOpGraph::build(invocation)?;
        let unit = Arc::new(CompiledUnit::new(key.clone(), invocation, graph));

        let mut entries = self.entries.lock().expect("compile cache poisoned");
        if let Some(existing) = entries.get(&key) {
            let existing = Arc::clone(existing);
            drop(entries);
            self.record_hit(&key);
            return Ok((existing, true));
        }
        if let Some((evicted, _)) = entries.push(key, Arc::clone(&unit)) {
            tracing::debug!(key = %evicted, "compile cache capacity eviction");
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            crate::profiling::cache_event("op_cache_evict");
        }
        drop(entries);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        crate::profiling::cache_event("op_cache_miss");
        Ok((unit, false))
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CompiledUnit<K>>> {
        let mut entries = self.entries.lock().expect("compile cache poisoned");
        entries.get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let entries = self.entries.lock().expect("compile cache poisoned");
        entries.contains(key)
    }

    /// Removes one entry. Holders of the unit keep it alive.
    pub fn evict(&self, key: &CacheKey) -> Option<Arc<CompiledUnit<K>>> {
        let removed = self
            .entries
            .lock()
            .expect("compile cache poisoned")
            .pop(key);
        if removed.is_some() {
            tracing::debug!(key = %key, "evicted compiled unit");
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            crate::profiling::cache_event("op_cache_evict");
        }
        removed
    }

    /// Evicts `unit` only if its key still maps to this very unit.
    pub fn evict_unit(&self, unit: &Arc<CompiledUnit<K>>) -> bool {
        let mut entries = self.entries.lock().expect("compile cache poisoned");
        let same = entries
            .peek(unit.key())
            .is_some_and(|current| Arc::ptr_eq(current, unit));
        if same {
            entries.pop(unit.key());
            drop(entries);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            crate::profiling::cache_event("op_cache_evict");
        }
        same
    }

    /// Clears the mapping and returns how many units were dropped from it.
    pub fn evict_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("compile cache poisoned");
        let count = entries.len();
        entries.clear();
        drop(entries);
        if count > 0 {
            tracing::debug!(count, "cleared compile cache");
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("compile cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    fn record_hit(&self, key: &CacheKey) {
        tracing::trace!(key = %key, "compile cache hit");
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        crate::profiling::cache_event("op_cache_hit");
    }
}
