//! Operator descriptors and the invocations that bind them to concrete values.

mod invocation;
mod primitive;

pub use invocation::{AbstractValue, InputRole, OpInvocation};
pub use primitive::{AttrValue, Primitive, ATTR_DYNAMIC_SHAPE, ATTR_PRIMITIVE_TARGET};
