//! Release of forward-pass outputs re-consumed by a later backward subgraph.
//!
//! These tensors cross subgraph boundaries, so they are tracked by tensor identity rather than by
//! [`ValueRef`](super::ValueRef). They reach the subgraph either as inputs or embedded as
//! constants; both kinds of edge count.

use std::collections::HashMap;

use super::subgraph::Subgraph;
use crate::tensor::{Tensor, TensorId, Value};

pub(crate) struct ForwardOutputTracker {
    remaining: HashMap<TensorId, (usize, Tensor)>,
    released: Vec<TensorId>,
}

impl ForwardOutputTracker {
    pub(crate) fn disabled() -> Self {
        Self {
            remaining: HashMap::new(),
            released: Vec::new(),
        }
    }

    /// Counts, per forward output, the input and constant edges of `subgraph` that read it.
    pub(crate) fn seed(subgraph: &Subgraph, inputs: &[Value]) -> Self {
        let mut tracker = Self::disabled();
        for op in subgraph.ops() {
            for operand in &op.operands {
                operand.for_each_input(&mut |index| {
                    if let Some(value) = inputs.get(index) {
                        tracker.count(value);
                    }
                });
                operand.for_each_constant(&mut |value| tracker.count(value));
            }
        }
        tracker
    }

    fn count(&mut self, value: &Value) {
        value.for_each_tensor(&mut |tensor| {
            if tensor.is_forward_output() {
                self.remaining
                    .entry(tensor.id())
                    .or_insert_with(|| (0, tensor.clone()))
                    .0 += 1;
            }
        });
    }

    pub(crate) fn tracked(&self) -> usize {
        self.remaining.len()
    }

    /// Takes one consuming edge off every forward output in `value` and returns the ones with no
    /// edges left. Clearing them is up to the caller, which knows who else still holds them.
    pub(crate) fn consume(&mut self, value: &Value) -> Vec<Tensor> {
        let mut exhausted = Vec::new();
        if self.remaining.is_empty() {
            return exhausted;
        }
        value.for_each_tensor(&mut |tensor| {
            let id = tensor.id();
            let Some((count, _)) = self.remaining.get_mut(&id) else {
                return;
            };
            *count -= 1;
            if *count == 0 {
                if let Some((_, tensor)) = self.remaining.remove(&id) {
                    exhausted.push(tensor);
                }
            }
        });
        exhausted
    }

    /// Detaches the storage of an exhausted forward output.
    pub(crate) fn release(&mut self, tensor: &Tensor) {
        tensor.clear_device_storage();
        tracing::trace!(tensor = %tensor.id(), "released forward output");
        self.released.push(tensor.id());
    }

    pub(crate) fn released(&self) -> &[TensorId] {
        &self.released
    }
}
