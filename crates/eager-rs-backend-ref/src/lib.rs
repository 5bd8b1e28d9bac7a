//! Host reference backend for `eager-rs`.
//!
//! [`RefAllocator`] simulates device memory and records every allocation and free, so tests can
//! check exactly when storage is released. [`RefExecutor`] implements a handful of `f32`
//! elementwise operators on top of it.

mod allocator;
mod executor;

pub use allocator::{AllocEvent, RefAllocator};
pub use executor::{RefExecutor, RefKernel};
