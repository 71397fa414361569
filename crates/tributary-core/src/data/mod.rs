//! Schemaless data model.
//!
//! Tuples carry a string-keyed [`Map`] of runtime-tagged [`Value`]s.
//! Accessors are strict: no implicit coercion between tags. Path-expression
//! evaluation over these values lives outside this crate; the model here is
//! just the tagged sum and its conversions.

mod value;

pub use value::{Map, TypeError, Value, ValueKind};
