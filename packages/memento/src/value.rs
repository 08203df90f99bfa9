//! The in-memory value model exchanged with the host engine.
//!
//! Node callables produce a [`Value`], and the cache fingerprints, stores,
//! and replays values of this shape. The variants enumerate the shapes the
//! fingerprinter knows how to dispatch on; anything outside the model travels
//! as [`Opaque`] and only gains discrimination through a registered class
//! hasher (see [`crate::fingerprint::register_opaque_hasher`]).

use serde::{Deserialize, Serialize};

/// A value produced by a node, as seen by the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Ordered sequence. Element order is significant.
    Sequence(Vec<Value>),
    /// Unordered key-value mapping. Insertion order is preserved in memory
    /// but never significant to the cache.
    Mapping(Vec<(Value, Value)>),
    /// Unordered collection of distinct elements.
    Set(Vec<Value>),
    /// Composite object with an introspectable field map.
    Record(Record),
    /// Tabular value reduced to per-row hashes by the host.
    Table(Table),
    /// A value outside the model.
    Opaque(Opaque),
}

/// An introspected composite object: a type name plus its field map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub type_name: String,
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(type_name: impl Into<String>, fields: Vec<(String, Value)>) -> Self {
        Self {
            type_name: type_name.into(),
            fields,
        }
    }
}

/// A tabular value, reduced by a host-provided row hasher to a stable hash
/// per row, keyed by the row's index value.
///
/// The physical ordering of rows is not significant: the fingerprinter treats
/// the rows as a mapping `row index -> row hash`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<(Value, u64)>,
}

impl Table {
    pub fn new(rows: Vec<(Value, u64)>) -> Self {
        Self { rows }
    }
}

/// Marker for a value the host could not render into the model.
///
/// The `type_name` identifies the value class so that a registered hasher
/// can take over; without one the fingerprinter falls back to a constant
/// digest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Opaque {
    pub type_name: String,
    /// Host-supplied bytes a registered class hasher may digest. Never
    /// interpreted by the cache itself.
    pub repr: Option<Vec<u8>>,
}

impl Opaque {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            repr: None,
        }
    }

    pub fn with_repr(mut self, repr: impl Into<Vec<u8>>) -> Self {
        self.repr = Some(repr.into());
        self
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::Sequence(iter.into_iter().collect())
    }
}
