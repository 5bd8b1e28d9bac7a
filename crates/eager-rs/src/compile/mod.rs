//! Fingerprinting, single-operator graph construction and the compilation cache.

mod builder;
mod cache;
mod fingerprint;
mod graph;
mod ready;

pub(crate) use builder::KernelBuilder;
pub use cache::{CacheStats, CompilationCache, CompiledUnit, ReadyKernel};
pub use fingerprint::{fingerprint, CacheKey, EXCLUDED_ATTRS};
pub use graph::{Node, NodeId, NodeKind, OutputInfo, SingleOpGraph, INVALID_INFER_RESULT_OPS};
pub use ready::{Readiness, ReadySignal};
