mod common;

use std::collections::BTreeSet;

use common::{f32_out, runtime_with, GPU};
use eager_rs::runtime::LifecycleManager;
use eager_rs::{InputRole, Operand, Primitive, RuntimeConfig, Subgraph, ValueRef};
use proptest::prelude::*;
use proptest::sample::Index;

/// Random DAG over one input: each op is `Neg` of one earlier value or `Add` of two.
fn random_subgraph(ops: &[(bool, Index, Index)], outputs: &[Index]) -> Subgraph {
    let mut subgraph = Subgraph::new(GPU);
    let mut sources = vec![subgraph.add_input(InputRole::OpOutput)];
    for (binary, lhs, rhs) in ops {
        let lhs = lhs.get(&sources).clone();
        let produced = if *binary {
            let rhs = rhs.get(&sources).clone();
            subgraph.push(Primitive::new("Add"), vec![lhs, rhs], f32_out(&[4]))
        } else {
            subgraph.push(Primitive::new("Neg"), vec![lhs], f32_out(&[4]))
        };
        sources.push(produced.into());
    }
    let leaves = outputs.iter().map(|index| index.get(&sources).clone()).collect();
    subgraph.set_output(Operand::MakeTuple(leaves));
    subgraph
}

fn refs_of<'a>(operands: impl IntoIterator<Item = &'a Operand>) -> BTreeSet<ValueRef> {
    let mut refs = BTreeSet::new();
    for operand in operands {
        operand.for_each_ref(&mut |value| {
            refs.insert(value);
        });
    }
    refs
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn every_intermediate_is_released_at_most_once(
        ops in prop::collection::vec((any::<bool>(), any::<Index>(), any::<Index>()), 1..10),
        outputs in prop::collection::vec(any::<Index>(), 0..4),
    ) {
        let subgraph = random_subgraph(&ops, &outputs);
        let (executor, runtime) = runtime_with(RuntimeConfig::default().with_async_kernel_build(false));
        let input = executor.upload(GPU, &[4], &[1.0, -2.0, 3.0, -4.0]).expect("upload");

        let counting = LifecycleManager::new(&subgraph, vec![input.clone().into()], true)
            .expect("valid subgraph");
        prop_assert_eq!(counting.initial_total(), subgraph.output_edge_count());
        drop(counting);

        let (output, report) = runtime
            .run_subgraph_with_report(&subgraph, vec![input.into()])
            .expect("run");

        let consumed = refs_of(subgraph.ops().iter().flat_map(|op| op.operands.iter()));
        let retained = refs_of([subgraph.output()]);
        let released: BTreeSet<ValueRef> = report.released.iter().copied().collect();
        prop_assert_eq!(released.len(), report.released.len());
        prop_assert!(report.leaked.is_empty());
        prop_assert!(report.outstanding.is_empty());
        let expected: BTreeSet<ValueRef> = consumed.difference(&retained).copied().collect();
        prop_assert_eq!(&released, &expected);

        let allocator = executor.allocator();
        prop_assert_eq!(allocator.invalid_free_count(), 0);
        prop_assert_eq!(allocator.live_count(), 1 + retained.len());

        drop(output);
        prop_assert_eq!(allocator.live_count(), 1);
        prop_assert_eq!(allocator.invalid_free_count(), 0);
    }
}
