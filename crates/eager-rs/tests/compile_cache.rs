mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{f32_out, runtime, runtime_with, GPU};
use eager_rs::compile::{fingerprint, Readiness};
use eager_rs::{
    CompileError, InputRole, OpInvocation, Operand, Primitive, RunError, RuntimeConfig, Subgraph,
};
use eager_rs_backend_ref::RefExecutor;

fn add_invocation(
    executor: &RefExecutor,
    lhs: &[usize],
    rhs: &[usize],
) -> anyhow::Result<OpInvocation> {
    let x = executor.upload(GPU, lhs, &vec![1.0; lhs.iter().product()])?;
    let y = executor.upload(GPU, rhs, &vec![2.0; rhs.iter().product()])?;
    Ok(OpInvocation::new(Primitive::new("Add"), f32_out(lhs), GPU)
        .with_input(x, InputRole::OpOutput)
        .with_input(y, InputRole::OpOutput))
}

#[test]
fn identical_invocations_share_one_unit() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    let first = add_invocation(&executor, &[2, 3], &[2, 3])?;
    let second = add_invocation(&executor, &[2, 3], &[2, 3])?;

    let (unit_a, hit_a) = runtime.compile(&first)?;
    let (unit_b, hit_b) = runtime.compile(&second)?;
    assert!(!hit_a);
    assert!(hit_b);
    assert!(Arc::ptr_eq(&unit_a, &unit_b));
    assert_eq!(unit_a.graph_id(), unit_b.graph_id());

    unit_b.wait_ready(16)?;
    assert_eq!(unit_a.readiness(), Readiness::Ready);
    assert_eq!(executor.kernels_created(), 1);

    let stats = runtime.cache_stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    Ok(())
}

#[test]
fn different_shapes_get_distinct_units() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    let mismatched = add_invocation(&executor, &[2, 3], &[4, 3])?;
    let matched = add_invocation(&executor, &[2, 3], &[2, 3])?;
    assert_ne!(fingerprint(&mismatched), fingerprint(&matched));

    let (unit_a, _) = runtime.compile(&mismatched)?;
    let (unit_b, hit) = runtime.compile(&matched)?;
    assert!(!hit);
    assert!(!Arc::ptr_eq(&unit_a, &unit_b));
    assert_ne!(unit_a.graph_id(), unit_b.graph_id());
    assert_eq!(runtime.cache().len(), 2);
    Ok(())
}

#[test]
fn run_op_computes_on_the_reference_backend() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    let invocation = add_invocation(&executor, &[2, 3], &[2, 3])?;
    let outputs = runtime.run_op(&invocation)?;
    assert_eq!(outputs.len(), 1);
    let tensor = outputs[0].as_tensor().expect("tensor output");
    assert_eq!(executor.download(tensor)?, vec![3.0; 6]);
    assert_eq!(executor.launches(), vec!["Add".to_string()]);
    Ok(())
}

#[test]
fn concurrent_compiles_build_one_kernel() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    executor.set_build_delay(Some(Duration::from_millis(20)));
    let invocation = add_invocation(&executor, &[4], &[4])?;

    let units = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| -> Result<_, CompileError> {
                    let (unit, _) = runtime.compile(&invocation)?;
                    unit.wait_ready(4)?;
                    Ok(unit)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("compile thread panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    assert!(units.iter().all(|unit| Arc::ptr_eq(unit, &units[0])));
    assert!(units.iter().all(|unit| unit.is_ready()));
    assert_eq!(executor.kernels_created(), 1);
    assert_eq!(runtime.cache().len(), 1);
    Ok(())
}

#[test]
fn equal_device_values_share_a_key() -> anyhow::Result<()> {
    let (executor, _runtime) = runtime();
    let gather = |axis: eager_rs::Tensor, role: InputRole| -> anyhow::Result<OpInvocation> {
        let data = executor.upload(GPU, &[4], &[1.0, 2.0, 3.0, 4.0])?;
        Ok(OpInvocation::new(Primitive::new("Gather").with_value_depend(1), f32_out(&[4]), GPU)
            .with_input(data, InputRole::OpOutput)
            .with_input(axis, role))
    };

    let constant = |value: f32| executor.upload(GPU, &[1], &[value]);
    assert_eq!(
        fingerprint(&gather(constant(0.0)?, InputRole::Constant)?),
        fingerprint(&gather(constant(0.0)?, InputRole::Constant)?)
    );
    assert_ne!(
        fingerprint(&gather(constant(0.0)?, InputRole::Constant)?),
        fingerprint(&gather(constant(1.0)?, InputRole::Constant)?)
    );
    assert_eq!(
        fingerprint(&gather(constant(1.0)?, InputRole::OpOutput)?),
        fingerprint(&gather(constant(1.0)?, InputRole::OpOutput)?)
    );
    Ok(())
}

#[test]
fn repeated_subgraph_runs_reuse_value_steered_units() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    let mut subgraph = Subgraph::new(GPU);
    let p = subgraph.add_input(InputRole::OpOutput);
    let negated = subgraph.push(Primitive::new("Neg"), vec![p.clone()], f32_out(&[2]));
    let sum = subgraph.push(
        Primitive::new("Add").with_value_depend(1),
        vec![p, Operand::from(negated)],
        f32_out(&[2]),
    );
    subgraph.set_output(sum);

    let input = executor.upload(GPU, &[2], &[1.5, -2.5])?;
    for _ in 0..5 {
        let output = runtime.run_subgraph(&subgraph, vec![input.clone().into()])?;
        assert_eq!(executor.download(output.as_tensor().expect("tensor"))?, vec![0.0, 0.0]);
    }
    assert_eq!(runtime.cache().len(), 2);
    assert_eq!(executor.kernels_created(), 2);
    let stats = runtime.cache_stats();
    assert_eq!((stats.hits, stats.misses), (8, 2));
    Ok(())
}

#[test]
fn inline_builds_are_ready_after_compile() -> anyhow::Result<()> {
    let (executor, runtime) = runtime_with(RuntimeConfig::default().with_async_kernel_build(false));
    let invocation = add_invocation(&executor, &[2], &[2])?;
    let (unit, _) = runtime.compile(&invocation)?;
    assert!(unit.is_ready());
    assert!(unit.kernel().is_some());
    Ok(())
}

#[test]
fn failed_kernel_build_is_not_cached_and_frees_workspace() -> anyhow::Result<()> {
    let (executor, runtime) = runtime_with(RuntimeConfig::default().with_async_kernel_build(false));
    executor.set_workspace_bytes(64);
    executor.fail_kernel("Neg");
    let x = executor.upload(GPU, &[3], &[1.0, 2.0, 3.0])?;
    let invocation =
        OpInvocation::new(Primitive::new("Neg"), f32_out(&[3]), GPU).with_input(x, InputRole::OpOutput);
    let key = fingerprint(&invocation);

    let err = runtime.run_op(&invocation).expect_err("build must fail");
    assert!(matches!(err, RunError::Compile(CompileError::KernelBuild { .. })));
    assert!(!runtime.cache().contains(&key));
    assert_eq!(executor.allocator().live_count(), 1, "only the input survives");

    executor.clear_faults();
    let outputs = runtime.run_op(&invocation)?;
    let values = executor.download(outputs[0].as_tensor().expect("tensor"))?;
    assert_eq!(values, vec![-1.0, -2.0, -3.0]);
    assert!(runtime.cache().contains(&key));
    // input, output and the unit's workspace
    assert_eq!(executor.allocator().live_count(), 3);

    assert!(runtime.evict(&key));
    assert_eq!(executor.allocator().live_count(), 2);
    assert_eq!(executor.allocator().invalid_free_count(), 0);
    Ok(())
}

#[test]
fn panicking_kernel_build_fails_the_unit() -> anyhow::Result<()> {
    let (executor, runtime) = runtime_with(RuntimeConfig::default().with_async_kernel_build(false));
    executor.panic_kernel("Relu");
    let x = executor.upload(GPU, &[2], &[1.0, -1.0])?;
    let invocation =
        OpInvocation::new(Primitive::new("Relu"), f32_out(&[2]), GPU).with_input(x, InputRole::OpOutput);

    let (unit, _) = runtime.compile(&invocation)?;
    assert_eq!(unit.readiness(), Readiness::Failed);
    assert!(unit.wait_ready(1).is_err());
    assert!(runtime.cache().is_empty());
    Ok(())
}

#[test]
fn erase_cache_ops_are_evicted_after_running() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    let x = executor.upload(GPU, &[2], &[1.0, 2.0])?;
    let invocation = OpInvocation::new(Primitive::new("Neg").with_erase_cache(), f32_out(&[2]), GPU)
        .with_input(x, InputRole::OpOutput);

    runtime.run_op(&invocation)?;
    assert!(runtime.cache().is_empty());
    runtime.run_op(&invocation)?;
    assert_eq!(executor.kernels_created(), 2);
    Ok(())
}

#[test]
fn dynamic_units_can_be_evicted_after_running() -> anyhow::Result<()> {
    let mut config = RuntimeConfig::default();
    config.evict_dynamic_units = true;
    let (executor, runtime) = runtime_with(config);
    let x = executor.upload(GPU, &[2], &[1.0, 2.0])?;
    let dynamic = OpInvocation::new(Primitive::new("Neg"), f32_out(&[2]), GPU)
        .with_input(x.clone(), InputRole::OpOutput)
        .with_dynamic_shape(true);
    let fixed = OpInvocation::new(Primitive::new("Neg"), f32_out(&[2]), GPU)
        .with_input(x, InputRole::OpOutput);

    runtime.run_op(&dynamic)?;
    assert!(runtime.cache().is_empty());
    runtime.run_op(&fixed)?;
    assert_eq!(runtime.cache().len(), 1);
    Ok(())
}

#[test]
fn side_effect_ops_key_by_primitive_instance() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    let x = executor.upload(GPU, &[2], &[1.0, 2.0])?;
    let stateful = Primitive::new("Neg").with_hidden_side_effect();
    let other = Primitive::new("Neg").with_hidden_side_effect();

    let call = |primitive: Primitive| {
        OpInvocation::new(primitive, f32_out(&[2]), GPU).with_input(x.clone(), InputRole::OpOutput)
    };
    let (first, _) = runtime.compile(&call(stateful.clone()))?;
    let (again, hit) = runtime.compile(&call(stateful))?;
    let (distinct, distinct_hit) = runtime.compile(&call(other))?;
    assert!(hit);
    assert!(Arc::ptr_eq(&first, &again));
    assert!(!distinct_hit);
    assert_ne!(first.key(), distinct.key());
    Ok(())
}

#[test]
fn evict_and_evict_all() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    let a = add_invocation(&executor, &[2], &[2])?;
    let b = add_invocation(&executor, &[3], &[3])?;
    let (unit_a, _) = runtime.compile(&a)?;
    runtime.compile(&b)?;
    unit_a.wait_ready(16)?;

    assert!(runtime.evict(unit_a.key()));
    assert!(!runtime.evict(unit_a.key()));
    // Holders keep an evicted unit usable.
    assert!(unit_a.kernel().is_some());

    let (rebuilt, hit) = runtime.compile(&a)?;
    assert!(!hit);
    assert!(!Arc::ptr_eq(&rebuilt, &unit_a));

    assert_eq!(runtime.evict_all(), 2);
    assert!(runtime.cache().is_empty());
    assert_eq!(runtime.evict_all(), 0);
    Ok(())
}

#[test]
fn bounded_cache_drops_least_recently_used() -> anyhow::Result<()> {
    let (executor, runtime) = runtime_with(RuntimeConfig::default().with_cache_capacity(Some(1)));
    let a = add_invocation(&executor, &[2], &[2])?;
    let b = add_invocation(&executor, &[3], &[3])?;
    runtime.compile(&a)?;
    runtime.compile(&b)?;
    assert_eq!(runtime.cache().len(), 1);
    assert!(runtime.cache().contains(&fingerprint(&b)));
    assert_eq!(runtime.cache_stats().evictions, 1);
    Ok(())
}

#[test]
fn malformed_invocation_is_rejected_before_caching() -> anyhow::Result<()> {
    let (executor, runtime) = runtime();
    let x = executor.upload(GPU, &[2], &[1.0, 2.0])?;
    let invocation = OpInvocation::new(Primitive::new("Add").with_input_count(2), f32_out(&[2]), GPU)
        .with_input(x, InputRole::OpOutput);
    let err = runtime.compile(&invocation).expect_err("arity mismatch");
    assert!(matches!(err, CompileError::Build(_)));
    assert!(runtime.cache().is_empty());
    Ok(())
}
