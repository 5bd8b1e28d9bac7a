//! Eager-mode operator execution core.
//!
//! Single operator invocations are fingerprinted, compiled once into a [`CompiledUnit`] and cached
//! by key; kernels for new units are created off the calling thread and published through a
//! one-shot readiness signal. Interpreted subgraphs run one operation at a time while a
//! dependency-counted lifecycle manager releases intermediate storage as soon as its last consumer
//! has run.

extern crate self as eager_rs;

pub mod backend;
pub mod compile;
pub mod config;
mod env;
pub mod error;
pub mod ops;
pub mod profiling;
pub mod runtime;
pub mod tensor;

pub use backend::spec::{Allocator, DType, DeviceTarget, Executor, Shape, TensorSpec};
pub use compile::{CacheKey, CompilationCache, CompiledUnit};
pub use config::RuntimeConfig;
pub use error::{BuildError, CompileError, LifecycleError, OutputMissingError, RunError};
pub use ops::{AbstractValue, InputRole, OpInvocation, Primitive};
pub use runtime::{EagerRuntime, Operand, Subgraph, ValueRef};
pub use tensor::{Tensor, Value};
