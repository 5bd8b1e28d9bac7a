//! Eager execution of single operators and interpreted subgraphs.

mod forward;
mod lifecycle;
mod reconstruct;
mod subgraph;

use std::sync::Arc;

pub use lifecycle::{BoundInputs, DrainReport, LifecycleManager, LifecycleState};
pub use reconstruct::reconstruct;
pub use subgraph::{Operand, Subgraph, SubgraphOp, ValueRef};

use crate::backend::spec::{Allocator, Executor};
use crate::compile::{CacheKey, CacheStats, CompilationCache, CompiledUnit, KernelBuilder};
use crate::config::RuntimeConfig;
use crate::error::{CompileError, RunError};
use crate::ops::OpInvocation;
use crate::tensor::Value;

/// Owns the compilation cache and the kernel builder for one executor.
pub struct EagerRuntime<E: Executor> {
    executor: Arc<E>,
    cache: Arc<CompilationCache<E::Kernel>>,
    builder: KernelBuilder<E>,
    config: RuntimeConfig,
}

impl<E: Executor> EagerRuntime<E> {
    pub fn new(executor: Arc<E>, allocator: Arc<dyn Allocator>, config: RuntimeConfig) -> Self {
        let cache = Arc::new(CompilationCache::new(config.cache_capacity));
        let builder = KernelBuilder::new(
            Arc::clone(&executor),
            allocator,
            Arc::clone(&cache),
            config.async_kernel_build,
        );
        Self {
            executor,
            cache,
            builder,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn cache(&self) -> &CompilationCache<E::Kernel> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Looks `invocation` up in the cache, building and scheduling its kernel on a miss.
    ///
    /// The returned unit may not be ready yet; use [`CompiledUnit::wait_ready`] before launching.
    pub fn compile(
        &self,
        invocation: &OpInvocation,
    ) -> Result<(Arc<CompiledUnit<E::Kernel>>, bool), CompileError> {
        let (unit, cache_hit) = self.cache.get_or_build(invocation)?;
        if !cache_hit {
            self.builder.submit(Arc::clone(&unit));
        }
        Ok((unit, cache_hit))
    }

    /// Compiles, waits for the kernel and launches one operator.
    pub fn run_op(&self, invocation: &OpInvocation) -> Result<Vec<Value>, RunError> {
        self.execute(invocation, None)
    }

    #[tracing::instrument(skip_all, fields(op = invocation.op_name()))]
    fn execute(
        &self,
        invocation: &OpInvocation,
        op_index: Option<usize>,
    ) -> Result<Vec<Value>, RunError> {
        let (unit, _) = self.compile(invocation)?;
        let kernel = unit.wait_ready(self.config.ready_spin_limit)?;
        let inputs = unit.graph().bind_inputs(invocation.inputs());
        let launched = self.executor.launch(kernel, &inputs);

        if unit.erase_after_run() || (self.config.evict_dynamic_units && unit.use_dynamic_shape()) {
            self.cache.evict_unit(&unit);
        }

        let outputs = launched.map_err(|source| RunError::Launch {
            op: invocation.op_name().to_string(),
            op_index,
            source,
        })?;
        self.check_outputs(&unit, &outputs)?;
        Ok(outputs)
    }

    /// Outputs must match the declared ones unless the unit refreshes shapes after running.
    fn check_outputs(
        &self,
        unit: &CompiledUnit<E::Kernel>,
        outputs: &[Value],
    ) -> Result<(), RunError> {
        let declared = unit.graph().declared_output().positions();
        if outputs.len() != declared.len() {
            return Err(RunError::OutputSpec {
                op: unit.op_name().to_string(),
                position: outputs.len().min(declared.len()),
            });
        }
        if unit.need_refresh_shape() {
            tracing::trace!(op = unit.op_name(), "taking output shapes from the launch");
            return Ok(());
        }
        match declared
            .iter()
            .zip(outputs)
            .position(|(expected, actual)| !expected.matches(actual))
        {
            Some(position) => Err(RunError::OutputSpec {
                op: unit.op_name().to_string(),
                position,
            }),
            None => Ok(()),
        }
    }

    /// Interprets `subgraph` on `inputs` and returns its declared output.
    pub fn run_subgraph(&self, subgraph: &Subgraph, inputs: Vec<Value>) -> Result<Value, RunError> {
        self.run_subgraph_with_report(subgraph, inputs)
            .map(|(output, _)| output)
    }

    /// Like [`run_subgraph`](Self::run_subgraph), also returning what the lifecycle manager released.
    #[tracing::instrument(skip_all, fields(ops = subgraph.ops().len()))]
    pub fn run_subgraph_with_report(
        &self,
        subgraph: &Subgraph,
        inputs: Vec<Value>,
    ) -> Result<(Value, DrainReport), RunError> {
        let mut lifecycle =
            LifecycleManager::new(subgraph, inputs, self.config.release_forward_outputs)?;
        for (index, op) in subgraph.ops().iter().enumerate() {
            let bound = lifecycle.bind(index)?;
            let invocation = OpInvocation::from_parts(
                op.primitive.clone(),
                bound.values,
                bound.roles,
                op.output.clone(),
                subgraph.device(),
            )
            .with_device_id(subgraph.device_id())
            .with_stream(op.stream_id)
            .with_dynamic_shape(subgraph.dynamic_shape() || op.output.is_dynamic())
            .with_dyn_input_sizes(bound.dyn_input_sizes);
            let outputs = self.execute(&invocation, Some(index))?;
            lifecycle.complete(index, outputs)?;
        }
        let output = lifecycle.reconstruct_output()?;
        let report = lifecycle.drain();
        tracing::debug!(
            released = report.released.len(),
            leaked = report.leaked.len(),
            forward_released = report.forward_released.len(),
            "subgraph finished"
        );
        Ok((output, report))
    }

    /// Drops one cached unit; returns whether it was present.
    pub fn evict(&self, key: &CacheKey) -> bool {
        self.cache.evict(key).is_some()
    }

    pub fn evict_all(&self) -> usize {
        self.cache.evict_all()
    }
}
