//! Dependency-counted lifetime of intermediate values in one subgraph interpretation.
//!
//! Before the first operation runs, every (consumer, input) edge that reads an operation output
//! adds one to that output's count. Operations then run strictly in order; after each one, the
//! inputs it consumed are decremented and a value whose count reaches zero leaves the produced
//! table and has its storage released. Storage that is still reachable from another live entry,
//! a retained output or a subgraph input is never freed here.
//!
//! Forward outputs whose last edge is consumed have their storage detached, unless the declared
//! output returns them; while a live entry still aliases one, detaching waits for that entry.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::forward::ForwardOutputTracker;
use super::reconstruct::reconstruct;
use super::subgraph::{Operand, Subgraph, SubgraphOp, ValueRef};
use crate::error::{LifecycleError, OutputMissingError};
use crate::ops::InputRole;
use crate::tensor::{storage_key, Tensor, TensorId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Counting,
    Executing,
    Drained,
}

/// Inputs of one operation, flattened the way the compiled graph expects them.
#[derive(Debug, Clone, Default)]
pub struct BoundInputs {
    pub values: Vec<Value>,
    pub roles: Vec<InputRole>,
    /// Per operand: expanded input count, `-1` for a plain operand. Empty when no operand is a tuple.
    pub dyn_input_sizes: Vec<i64>,
}

/// Outcome of a finished interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// References released, in release order.
    pub released: Vec<ValueRef>,
    /// Non-retained references still live when the subgraph finished.
    pub leaked: Vec<ValueRef>,
    /// References whose consumers never all ran.
    pub outstanding: Vec<(ValueRef, usize)>,
    pub forward_released: Vec<TensorId>,
}

pub struct LifecycleManager<'a> {
    subgraph: &'a Subgraph,
    inputs: Vec<Value>,
    state: LifecycleState,
    counts: BTreeMap<ValueRef, usize>,
    initial_total: usize,
    produced: BTreeMap<ValueRef, Value>,
    retained: BTreeSet<ValueRef>,
    /// Live produced entries per storage allocation.
    holders: HashMap<usize, usize>,
    /// Allocations owned by the caller (subgraph inputs and constants).
    pinned: HashSet<usize>,
    /// Allocations of inputs and constants the declared output hands back.
    returned: HashSet<usize>,
    released: Vec<ValueRef>,
    forward: ForwardOutputTracker,
    /// Exhausted forward outputs still aliased by a live entry, by allocation.
    deferred_forward: HashMap<usize, Tensor>,
    next_op: usize,
}

impl<'a> LifecycleManager<'a> {
    /// Validates references and runs the counting pass.
    pub fn new(
        subgraph: &'a Subgraph,
        inputs: Vec<Value>,
        release_forward_outputs: bool,
    ) -> Result<Self, LifecycleError> {
        if inputs.len() != subgraph.input_roles().len() {
            return Err(LifecycleError::InputCount {
                expected: subgraph.input_roles().len(),
                actual: inputs.len(),
            });
        }
        let forward = if release_forward_outputs && !subgraph.device().shares_host_memory() {
            ForwardOutputTracker::seed(subgraph, &inputs)
        } else {
            ForwardOutputTracker::disabled()
        };
        let mut manager = Self {
            subgraph,
            inputs,
            state: LifecycleState::NotStarted,
            counts: BTreeMap::new(),
            initial_total: 0,
            produced: BTreeMap::new(),
            retained: BTreeSet::new(),
            holders: HashMap::new(),
            pinned: HashSet::new(),
            returned: HashSet::new(),
            released: Vec::new(),
            forward,
            deferred_forward: HashMap::new(),
            next_op: 0,
        };
        manager.count()?;
        Ok(manager)
    }

    fn count(&mut self) -> Result<(), LifecycleError> {
        self.state = LifecycleState::Counting;
        let subgraph = self.subgraph;
        let ops = subgraph.ops();
        for (op_index, op) in ops.iter().enumerate() {
            for operand in &op.operands {
                self.check_operand(operand, op_index, op.primitive.name())?;
                operand.for_each_ref(&mut |value| *self.counts.entry(value).or_insert(0) += 1);
            }
        }
        self.check_operand(subgraph.output(), ops.len(), "<output>")?;
        subgraph.output().for_each_ref(&mut |value| {
            self.retained.insert(value);
        });
        self.initial_total = self.counts.values().sum();

        for value in &self.inputs {
            pin(&mut self.pinned, value);
        }
        for op in ops {
            for operand in &op.operands {
                pin_constants(&mut self.pinned, operand);
            }
        }
        pin_constants(&mut self.pinned, subgraph.output());
        subgraph
            .output()
            .for_each_input(&mut |index| pin(&mut self.returned, &self.inputs[index]));
        pin_constants(&mut self.returned, subgraph.output());

        tracing::trace!(
            ops = ops.len(),
            edges = self.initial_total,
            retained = self.retained.len(),
            forward_outputs = self.forward.tracked(),
            "lifecycle counting finished"
        );
        Ok(())
    }

    /// References must name an earlier operation and one of its declared outputs.
    fn check_operand(&self, operand: &Operand, op_index: usize, op: &str) -> Result<(), LifecycleError> {
        let ops = self.subgraph.ops();
        match operand {
            Operand::Output(value) => {
                let valid = value.op < op_index.min(ops.len())
                    && value.output < ops[value.op].output.arity();
                if valid {
                    Ok(())
                } else {
                    Err(LifecycleError::InvalidReference {
                        op: op.to_string(),
                        op_index,
                        value: *value,
                    })
                }
            }
            Operand::Input(input) if *input >= self.inputs.len() => Err(LifecycleError::UnknownInput {
                op: op.to_string(),
                op_index,
                input: *input,
                available: self.inputs.len(),
            }),
            Operand::MakeTuple(items) => items
                .iter()
                .try_for_each(|item| self.check_operand(item, op_index, op)),
            Operand::Input(_) | Operand::Constant(_) => Ok(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Outstanding consumers of `value`; `None` once released or if it was never counted.
    pub fn count_of(&self, value: ValueRef) -> Option<usize> {
        self.counts.get(&value).copied()
    }

    /// Sum of the counts produced by the counting pass.
    pub fn initial_total(&self) -> usize {
        self.initial_total
    }

    pub fn is_live(&self, value: ValueRef) -> bool {
        self.produced.contains_key(&value)
    }

    pub fn produced(&self) -> &BTreeMap<ValueRef, Value> {
        &self.produced
    }

    pub fn released(&self) -> &[ValueRef] {
        &self.released
    }

    pub fn next_op(&self) -> usize {
        self.next_op
    }

    /// Resolves the inputs of operation `op_index`, which must be the next one to run.
    pub fn bind(&mut self, op_index: usize) -> Result<BoundInputs, LifecycleError> {
        let op = self.op(op_index)?;
        self.state = LifecycleState::Executing;
        let mut bound = BoundInputs::default();
        let mut has_tuple = false;
        for (position, operand) in op.operands.iter().enumerate() {
            let value_depend = op.primitive.value_depend().contains(&position);
            let before = bound.values.len();
            if self.flatten(operand, op_index, value_depend, &mut bound)? {
                has_tuple = true;
                bound
                    .dyn_input_sizes
                    .push((bound.values.len() - before) as i64);
            } else {
                bound.dyn_input_sizes.push(-1);
            }
        }
        if !has_tuple {
            bound.dyn_input_sizes.clear();
        }
        Ok(bound)
    }

    /// Appends the leaves of `operand`; returns whether it expanded into several inputs.
    ///
    /// Tuple operands, and tuple values read from inputs or earlier outputs, are flattened to their
    /// leaves. An embedded forward output is bound as data unless its position steers kernel
    /// selection, so its per-step value does not split cache entries.
    fn flatten(
        &self,
        operand: &Operand,
        op_index: usize,
        value_depend: bool,
        bound: &mut BoundInputs,
    ) -> Result<bool, LifecycleError> {
        match operand {
            Operand::Input(index) => Ok(push_leaves(
                bound,
                &self.inputs[*index],
                self.subgraph.input_roles()[*index],
            )),
            Operand::Constant(value) => {
                let role = match value {
                    Value::Tensor(tensor) if tensor.is_forward_output() && !value_depend => {
                        InputRole::OpOutput
                    }
                    _ => InputRole::Constant,
                };
                bound.values.push(value.clone());
                bound.roles.push(role);
                Ok(false)
            }
            Operand::Output(value) => {
                let live = self.produced.get(value).ok_or_else(|| {
                    LifecycleError::MissingProducedValue {
                        op: self.op_name(op_index),
                        op_index,
                        value: *value,
                    }
                })?;
                Ok(push_leaves(bound, live, InputRole::OpOutput))
            }
            Operand::MakeTuple(items) => {
                for item in items {
                    self.flatten(item, op_index, value_depend, bound)?;
                }
                Ok(true)
            }
        }
    }

    /// Publishes the outputs of `op_index`, then retires the inputs it consumed.
    pub fn complete(&mut self, op_index: usize, outputs: Vec<Value>) -> Result<(), LifecycleError> {
        let op = self.op(op_index)?;
        let expected = op.output.arity();
        if outputs.len() != expected {
            return Err(LifecycleError::OutputArity {
                op: op.primitive.name().to_string(),
                op_index,
                expected,
                actual: outputs.len(),
            });
        }
        self.state = LifecycleState::Executing;

        for (position, value) in outputs.into_iter().enumerate() {
            let reference = ValueRef::new(op_index, position);
            self.hold(&value);
            if self.counts.contains_key(&reference) || self.retained.contains(&reference) {
                self.produced.insert(reference, value);
            } else {
                // Nobody reads it: give the storage back right away.
                tracing::trace!(value = %reference, "discarding unused output");
                self.release_storage(&value);
            }
        }

        let mut consumed = Vec::new();
        let mut exhausted = Vec::new();
        for operand in &op.operands {
            operand.for_each_ref(&mut |value| consumed.push(value));
            operand.for_each_input(&mut |index| {
                exhausted.extend(self.forward.consume(&self.inputs[index]));
            });
            operand.for_each_constant(&mut |value| exhausted.extend(self.forward.consume(value)));
        }
        for value in consumed {
            self.retire(op_index, value)?;
        }
        for tensor in exhausted {
            self.release_forward(tensor);
        }

        self.next_op += 1;
        if self.next_op == self.subgraph.ops().len() && self.counts.is_empty() {
            self.state = LifecycleState::Drained;
        }
        Ok(())
    }

    fn retire(&mut self, op_index: usize, value: ValueRef) -> Result<(), LifecycleError> {
        let Some(count) = self.counts.get_mut(&value) else {
            return Err(LifecycleError::MissingCount {
                op: self.op_name(op_index),
                op_index,
                value,
            });
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        self.counts.remove(&value);
        if self.retained.contains(&value) {
            return Ok(());
        }
        let Some(live) = self.produced.remove(&value) else {
            return Err(LifecycleError::MissingProducedValue {
                op: self.op_name(op_index),
                op_index,
                value,
            });
        };
        tracing::trace!(value = %value, op = op_index, "released intermediate");
        self.released.push(value);
        self.release_storage(&live);
        Ok(())
    }

    /// Detaches an exhausted forward output now, after its last live alias goes, or never when the
    /// declared output returns it.
    fn release_forward(&mut self, tensor: Tensor) {
        let Some(key) = tensor.storage().map(|storage| storage_key(&storage)) else {
            self.forward.release(&tensor);
            return;
        };
        if self.returned.contains(&key) {
            tracing::trace!(tensor = %tensor.id(), "forward output is part of the subgraph output");
        } else if self.holders.get(&key).is_some_and(|holders| *holders > 0) {
            tracing::trace!(tensor = %tensor.id(), "forward output still aliased, deferring release");
            self.deferred_forward.insert(key, tensor);
        } else {
            self.forward.release(&tensor);
        }
    }

    fn hold(&mut self, value: &Value) {
        value.for_each_tensor(&mut |tensor| {
            if let Some(storage) = tensor.storage() {
                *self.holders.entry(storage_key(&storage)).or_insert(0) += 1;
            }
        });
    }

    /// Drops one holder per tensor leaf and frees allocations nobody else holds.
    fn release_storage(&mut self, value: &Value) {
        value.for_each_tensor(&mut |tensor| {
            let Some(storage) = tensor.storage() else {
                return;
            };
            let key = storage_key(&storage);
            let remaining = match self.holders.get_mut(&key) {
                Some(holders) => {
                    *holders = holders.saturating_sub(1);
                    *holders
                }
                None => 0,
            };
            if remaining > 0 {
                return;
            }
            self.holders.remove(&key);
            if let Some(forward) = self.deferred_forward.remove(&key) {
                self.forward.release(&forward);
            }
            if !self.pinned.contains(&key) {
                tensor.release_storage();
            }
        });
    }

    /// Rebuilds the declared output. Leaves stay in the produced table until [`drain`](Self::drain).
    pub fn reconstruct_output(&self) -> Result<Value, OutputMissingError> {
        reconstruct(self.subgraph.output(), &self.produced, &self.inputs)
    }

    /// Ends the interpretation.
    ///
    /// Retained outputs pass to the caller without being released; anything else still live is
    /// reported as a leak and released.
    pub fn drain(mut self) -> DrainReport {
        let retained = std::mem::take(&mut self.retained);
        for value in &retained {
            self.produced.remove(value);
        }
        let leftovers = std::mem::take(&mut self.produced);
        let mut leaked = Vec::with_capacity(leftovers.len());
        for (value, live) in leftovers {
            tracing::warn!(value = %value, "intermediate value still live after subgraph finished");
            self.release_storage(&live);
            leaked.push(value);
        }
        let outstanding: Vec<(ValueRef, usize)> =
            self.counts.iter().map(|(value, count)| (*value, *count)).collect();
        if !outstanding.is_empty() {
            tracing::warn!(
                outstanding = outstanding.len(),
                "subgraph finished with unconsumed dependency counts"
            );
        }
        self.state = LifecycleState::Drained;
        DrainReport {
            released: std::mem::take(&mut self.released),
            leaked,
            outstanding,
            forward_released: self.forward.released().to_vec(),
        }
    }

    fn op(&self, op_index: usize) -> Result<&'a SubgraphOp, LifecycleError> {
        let subgraph: &'a Subgraph = self.subgraph;
        let op = subgraph
            .ops()
            .get(op_index)
            .ok_or(LifecycleError::OutOfOrder {
                op: "<none>".to_string(),
                op_index,
                expected: self.next_op,
            })?;
        if op_index != self.next_op {
            return Err(LifecycleError::OutOfOrder {
                op: op.primitive.name().to_string(),
                op_index,
                expected: self.next_op,
            });
        }
        Ok(op)
    }

    fn op_name(&self, op_index: usize) -> String {
        self.subgraph
            .ops()
            .get(op_index)
            .map(|op| op.primitive.name().to_string())
            .unwrap_or_else(|| "<output>".to_string())
    }
}

fn pin(pinned: &mut HashSet<usize>, value: &Value) {
    value.for_each_tensor(&mut |tensor| {
        if let Some(storage) = tensor.storage() {
            pinned.insert(storage_key(&storage));
        }
    });
}

/// Pushes `value`, or the leaves of a tuple value, with `role`; returns whether it was a tuple.
fn push_leaves(bound: &mut BoundInputs, value: &Value, role: InputRole) -> bool {
    match value {
        Value::Tuple(items) => {
            for item in items.iter() {
                push_leaves(bound, item, role);
            }
            true
        }
        other => {
            bound.values.push(other.clone());
            bound.roles.push(role);
            false
        }
    }
}

fn pin_constants(pinned: &mut HashSet<usize>, operand: &Operand) {
    match operand {
        Operand::Constant(value) => pin(pinned, value),
        Operand::MakeTuple(items) => {
            for item in items {
                pin_constants(pinned, item);
            }
        }
        Operand::Input(_) | Operand::Output(_) => {}
    }
}
