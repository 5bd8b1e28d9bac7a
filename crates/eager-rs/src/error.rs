//! Error taxonomy for compilation, subgraph interpretation and output reconstruction.

use thiserror::Error;

use crate::backend::spec::BackendError;
use crate::runtime::ValueRef;

/// Malformed invocation; fatal to that single operation and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("{op}: expected {expected} inputs, got {actual}")]
    ArityMismatch {
        op: String,
        expected: usize,
        actual: usize,
    },
    #[error("{op}: {values} input values but {roles} role tags")]
    RoleCountMismatch {
        op: String,
        values: usize,
        roles: usize,
    },
    #[error("{op}: input {position} has unrecognised role code {code}")]
    UnknownRole {
        op: String,
        position: usize,
        code: i32,
    },
    #[error("{op}: input {position} is bound to a graph placeholder but is a {kind}, not a tensor")]
    NonTensorPlaceholder {
        op: String,
        position: usize,
        kind: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("kernel build for {op} (key {key}) failed: {message}")]
    KernelBuild {
        op: String,
        key: String,
        message: String,
    },
}

/// The counting pass and the actual execution disagree. Continuing could free live storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("op #{op_index} {op}: consumed {value} has no dependency count")]
    MissingCount {
        op: String,
        op_index: usize,
        value: ValueRef,
    },
    #[error("op #{op_index} {op}: consumed {value} is not live")]
    MissingProducedValue {
        op: String,
        op_index: usize,
        value: ValueRef,
    },
    #[error("op #{op_index} {op}: {value} does not name an earlier operation")]
    InvalidReference {
        op: String,
        op_index: usize,
        value: ValueRef,
    },
    #[error("op #{op_index} {op}: subgraph input {input} out of range ({available} bound)")]
    UnknownInput {
        op: String,
        op_index: usize,
        input: usize,
        available: usize,
    },
    #[error("op #{op_index} {op}: declared {expected} outputs, executor returned {actual}")]
    OutputArity {
        op: String,
        op_index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("op #{op_index} {op} finished out of order (expected op #{expected})")]
    OutOfOrder {
        op: String,
        op_index: usize,
        expected: usize,
    },
    #[error("subgraph expects {expected} inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("subgraph output {path} refers to {value}, which is not live")]
pub struct OutputMissingError {
    pub value: ValueRef,
    /// Position of the leaf inside the declared output, e.g. `out.1.0`.
    pub path: String,
}

/// Failure of `run_op` or `run_subgraph`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    OutputMissing(#[from] OutputMissingError),
    #[error("{op}{}: launch failed", op_index_suffix(.op_index))]
    Launch {
        op: String,
        op_index: Option<usize>,
        #[source]
        source: BackendError,
    },
    #[error("{op}: output {position} does not match the declared output")]
    OutputSpec { op: String, position: usize },
}

fn op_index_suffix(op_index: &Option<usize>) -> String {
    op_index
        .map(|index| format!(" (op #{index})"))
        .unwrap_or_default()
}
