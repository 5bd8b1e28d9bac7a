//! Rebuilds the declared, possibly nested, subgraph output from the live value table.

use std::collections::{BTreeMap, HashMap};

use super::subgraph::{Operand, ValueRef};
use crate::error::OutputMissingError;
use crate::tensor::Value;

/// Rebuilds `output` from `produced` without removing anything from it.
///
/// Leaves naming the same [`ValueRef`] resolve to one shared value object.
pub fn reconstruct(
    output: &Operand,
    produced: &BTreeMap<ValueRef, Value>,
    inputs: &[Value],
) -> Result<Value, OutputMissingError> {
    let mut reconstructor = Reconstructor {
        produced,
        inputs,
        memo: HashMap::new(),
    };
    let mut path = vec![];
    reconstructor.visit(output, &mut path)
}

struct Reconstructor<'a> {
    produced: &'a BTreeMap<ValueRef, Value>,
    inputs: &'a [Value],
    memo: HashMap<ValueRef, Value>,
}

impl Reconstructor<'_> {
    fn visit(&mut self, operand: &Operand, path: &mut Vec<usize>) -> Result<Value, OutputMissingError> {
        match operand {
            Operand::Output(value) => {
                if let Some(hit) = self.memo.get(value) {
                    return Ok(hit.clone());
                }
                let found = self.produced.get(value).cloned().ok_or_else(|| OutputMissingError {
                    value: *value,
                    path: render_path(path),
                })?;
                self.memo.insert(*value, found.clone());
                Ok(found)
            }
            Operand::Input(index) => Ok(self.inputs.get(*index).cloned().unwrap_or(Value::None)),
            Operand::Constant(value) => Ok(value.clone()),
            Operand::MakeTuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    path.push(index);
                    let value = self.visit(item, path);
                    path.pop();
                    values.push(value?);
                }
                Ok(Value::tuple(values))
            }
        }
    }
}

fn render_path(path: &[usize]) -> String {
    let mut rendered = String::from("out");
    for index in path {
        rendered.push('.');
        rendered.push_str(&index.to_string());
    }
    rendered
}
