//! Runtime-tagged values carried inside tuples.
//!
//! [`Value`] is a tagged sum covering every type a schemaless tuple field can
//! hold. Accessors are type-checked: asking an `Int` for its string payload
//! fails with a [`TypeError`] at the call site instead of silently coercing.
//!
//! Values convert to and from `serde_json::Value` for interchange with
//! external systems. Timestamps serialize as RFC 3339 strings; blobs as
//! arrays of numbers.

use std::fmt;

use chrono::{DateTime, Utc};
use fxhash::FxHashMap;

/// A string-keyed mapping of values. This is the type of a tuple's data.
pub type Map = FxHashMap<String, Value>;

/// The tag of a [`Value`], used in type errors and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Absent value.
    Null,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Blob,
    /// Wall-clock timestamp.
    Timestamp,
    /// Ordered sequence of values.
    Array,
    /// String-keyed mapping of values.
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Blob => "blob",
            Self::Timestamp => "timestamp",
            Self::Array => "array",
            Self::Map => "map",
        };
        f.write_str(s)
    }
}

/// A type-checked access failed because the value has a different tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("type mismatch: expected {expected}, got {actual}")]
pub struct TypeError {
    /// The tag the caller asked for.
    pub expected: ValueKind,
    /// The tag the value actually has.
    pub actual: ValueKind,
}

/// A schemaless runtime value.
///
/// `Clone` performs a deep copy; there is no structural sharing between
/// clones, so a cloned value may be mutated freely.
///
/// Accessors do not coerce: `as_float` on an `Int` is a [`TypeError`].
/// Lossy conversions are the caller's job.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float. Equality is plain `f64` equality; `NaN != NaN`.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Blob(Vec<u8>),
    /// Wall-clock timestamp.
    Timestamp(DateTime<Utc>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// String-keyed mapping of values.
    Map(Map),
}

impl Value {
    /// Returns the tag of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
            Self::Blob(_) => ValueKind::Blob,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Array(_) => ValueKind::Array,
            Self::Map(_) => ValueKind::Map,
        }
    }

    /// Returns true if the value is `Null`.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn mismatch(&self, expected: ValueKind) -> TypeError {
        TypeError {
            expected,
            actual: self.kind(),
        }
    }

    /// Returns the boolean payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not a `Bool`.
    pub fn as_bool(&self) -> Result<bool, TypeError> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(other.mismatch(ValueKind::Bool)),
        }
    }

    /// Returns the integer payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not an `Int`.
    pub fn as_int(&self) -> Result<i64, TypeError> {
        match self {
            Self::Int(i) => Ok(*i),
            other => Err(other.mismatch(ValueKind::Int)),
        }
    }

    /// Returns the float payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not a `Float`.
    pub fn as_float(&self) -> Result<f64, TypeError> {
        match self {
            Self::Float(f) => Ok(*f),
            other => Err(other.mismatch(ValueKind::Float)),
        }
    }

    /// Returns the string payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not a `String`.
    pub fn as_str(&self) -> Result<&str, TypeError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(other.mismatch(ValueKind::String)),
        }
    }

    /// Returns the blob payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not a `Blob`.
    pub fn as_blob(&self) -> Result<&[u8], TypeError> {
        match self {
            Self::Blob(b) => Ok(b),
            other => Err(other.mismatch(ValueKind::Blob)),
        }
    }

    /// Returns the timestamp payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not a `Timestamp`.
    pub fn as_timestamp(&self) -> Result<DateTime<Utc>, TypeError> {
        match self {
            Self::Timestamp(t) => Ok(*t),
            other => Err(other.mismatch(ValueKind::Timestamp)),
        }
    }

    /// Returns the array payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not an `Array`.
    pub fn as_array(&self) -> Result<&[Value], TypeError> {
        match self {
            Self::Array(a) => Ok(a),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }

    /// Returns a mutable reference to the array payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not an `Array`.
    pub fn as_array_mut(&mut self) -> Result<&mut Vec<Value>, TypeError> {
        match self {
            Self::Array(a) => Ok(a),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }

    /// Returns the map payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not a `Map`.
    pub fn as_map(&self) -> Result<&Map, TypeError> {
        match self {
            Self::Map(m) => Ok(m),
            other => Err(other.mismatch(ValueKind::Map)),
        }
    }

    /// Returns a mutable reference to the map payload.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the value is not a `Map`.
    pub fn as_map_mut(&mut self) -> Result<&mut Map, TypeError> {
        match self {
            Self::Map(m) => Ok(m),
            other => Err(other.mismatch(ValueKind::Map)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Blob(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Self::Array(a)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Self::Map(m)
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Int(i) => Self::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f).map_or(Self::Null, Self::Number),
            Value::String(s) => Self::String(s),
            Value::Blob(b) => Self::Array(b.into_iter().map(|x| Self::Number(x.into())).collect()),
            Value::Timestamp(t) => Self::String(t.to_rfc3339()),
            Value::Array(a) => Self::Array(a.into_iter().map(Self::from).collect()),
            Value::Map(m) => {
                Self::Object(m.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(a) => Self::Array(a.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(o) => {
                Self::Map(o.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self.clone()))
    }
}
