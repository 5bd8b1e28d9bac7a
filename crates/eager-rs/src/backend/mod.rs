//! Contracts shared with device backends: tensor metadata, the allocator and the executor.

pub mod hashing;
pub mod spec;
