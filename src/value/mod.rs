//! The value model: what is asked for, what is promised, and the property
//! algebra that connects the two.
//!
//! All types here are immutable values with structural equality and a total
//! order, so they can key ordered maps and sets. The engine relies on that
//! ordering for deterministic resolution.

mod properties;
mod requirement;
mod target;

pub use properties::{Allowed, PropertySet};
pub use requirement::{ValueRequirement, ValueSpecification};
pub use target::{TargetIdentity, TargetSpecification, TargetType};

/// Reserved constraint naming the functions allowed to satisfy a requirement.
pub const FUNCTION_PROPERTY: &str = "Function";
