//! Value fingerprinting.
//!
//! [`hash_value`] deterministically maps a [`Value`] to a compact digest
//! string, dispatching on the value's shape. Primitives use a 128-bit digest
//! (they are short and numerous; the shorter digest amortizes); composite
//! shapes aggregate many primitive digests and use 224 bits for the lower
//! collision probability.

use std::collections::BTreeMap;
use std::sync::{LazyLock, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha224};
use tracing::trace;

use crate::value::{Opaque, Record, Table, Value};

/// Digest of the literal fallback for values nothing knows how to hash.
const UNHASHABLE: &str = "<unhashable>";

/// Recursion cap for record introspection. Past this depth a record
/// degrades to the fallback digest.
const MAX_RECORD_DEPTH: usize = 3;

/// A value digest, rendered as URL-safe base64 so it can double as a file
/// name and travel through web services unescaped.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
pub struct DataVersion(String);

impl DataVersion {
    /// Wrap a digest string previously rendered by this crate, e.g. read
    /// back from a store.
    pub fn new(rendered: impl Into<String>) -> Self {
        Self(rendered.into())
    }

    fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        Self(URL_SAFE.encode(digest))
    }

    /// View the digest as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&DataVersion> for DataVersion {
    fn from(version: &DataVersion) -> Self {
        version.clone()
    }
}

impl AsRef<str> for DataVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for DataVersion {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// The identity of one node execution: which node, which implementation
/// (`code`, a source-derived version string supplied by the host engine),
/// and which produced value (`data`).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Fingerprint {
    pub node_name: String,
    pub code: String,
    pub data: DataVersion,
}

impl Fingerprint {
    pub fn new(
        node_name: impl Into<String>,
        code: impl Into<String>,
        data: DataVersion,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            code: code.into(),
            data,
        }
    }
}

/// Hasher for one opaque value class.
pub type OpaqueHasher = fn(&Opaque) -> DataVersion;

static OPAQUE_HASHERS: LazyLock<RwLock<BTreeMap<String, OpaqueHasher>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

/// Register a hasher for an opaque value class, keyed by its type name.
///
/// Registration is process-wide. The first registration for a class wins;
/// repeat registrations are no-ops.
pub fn register_opaque_hasher(type_name: impl Into<String>, hasher: OpaqueHasher) {
    let mut hashers = OPAQUE_HASHERS
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    hashers.entry(type_name.into()).or_insert(hasher);
}

/// Fingerprint a value. Total: every value maps to a digest, at worst the
/// constant fallback for opaque values with no registered hasher.
pub fn hash_value(value: &Value) -> DataVersion {
    hash_value_at(value, 0)
}

fn hash_value_at(value: &Value, depth: usize) -> DataVersion {
    match value {
        Value::Bool(v) => hash_primitive(if *v { "true" } else { "false" }.as_bytes()),
        Value::Int(v) => hash_primitive(v.to_string().as_bytes()),
        Value::Float(v) => hash_primitive(v.to_string().as_bytes()),
        Value::Str(v) => hash_primitive(v.as_bytes()),
        Value::Bytes(v) => hash_primitive(v),
        Value::Sequence(elements) => hash_sequence(elements, depth),
        Value::Mapping(entries) => hash_mapping(entries, depth),
        Value::Set(elements) => hash_set(elements, depth),
        Value::Record(record) => hash_record(record, depth),
        Value::Table(table) => hash_table(table, depth),
        Value::Opaque(opaque) => hash_opaque(opaque),
    }
}

/// Digest of a primitive's canonical textual form.
fn hash_primitive(rendering: &[u8]) -> DataVersion {
    DataVersion::from_digest(md5::compute(rendering).0)
}

/// Digest of each element in iteration order. Order matters.
fn hash_sequence(elements: &[Value], depth: usize) -> DataVersion {
    let mut hasher = Sha224::new();
    for element in elements {
        hasher.update(hash_value_at(element, depth).as_str());
    }
    DataVersion::from_digest(hasher.finalize())
}

/// Digest of `digest(key) || digest(value)` per entry, traversed in
/// canonical order (sorted by key digest) so that two mappings with equal
/// contents produce equal digests regardless of insertion order.
fn hash_mapping(entries: &[(Value, Value)], depth: usize) -> DataVersion {
    let pairs = entries
        .iter()
        .map(|(key, value)| (hash_value_at(key, depth), hash_value_at(value, depth)))
        .collect();
    hash_sorted_pairs(pairs)
}

/// Element digests sorted lexicographically, then hashed together.
/// Order-independent.
fn hash_set(elements: &[Value], depth: usize) -> DataVersion {
    let mut digests: Vec<DataVersion> = elements
        .iter()
        .map(|element| hash_value_at(element, depth))
        .collect();
    digests.sort();

    let mut hasher = Sha224::new();
    for digest in &digests {
        hasher.update(digest.as_str());
    }
    DataVersion::from_digest(hasher.finalize())
}

/// Recurse into the field map as a mapping `field name -> field value`,
/// bumping the introspection depth. Past the cap, fall back to the constant
/// digest rather than chase arbitrarily nested objects.
fn hash_record(record: &Record, depth: usize) -> DataVersion {
    if depth >= MAX_RECORD_DEPTH {
        trace!(type_name = %record.type_name, "record introspection depth exceeded");
        return hash_primitive(UNHASHABLE.as_bytes());
    }

    let pairs = record
        .fields
        .iter()
        .map(|(name, value)| (hash_primitive(name.as_bytes()), hash_value_at(value, depth + 1)))
        .collect();
    hash_sorted_pairs(pairs)
}

/// Treat the rows as a mapping `row index -> row hash`, so the physical
/// ordering of rows does not affect the digest.
fn hash_table(table: &Table, depth: usize) -> DataVersion {
    let pairs = table
        .rows
        .iter()
        .map(|(index, row_hash)| {
            (
                hash_value_at(index, depth),
                hash_primitive(row_hash.to_string().as_bytes()),
            )
        })
        .collect();
    hash_sorted_pairs(pairs)
}

fn hash_opaque(opaque: &Opaque) -> DataVersion {
    let hashers = OPAQUE_HASHERS
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match hashers.get(&opaque.type_name) {
        Some(hasher) => hasher(opaque),
        None => hash_primitive(UNHASHABLE.as_bytes()),
    }
}

fn hash_sorted_pairs(mut pairs: Vec<(DataVersion, DataVersion)>) -> DataVersion {
    pairs.sort();

    let mut hasher = Sha224::new();
    for (key_digest, value_digest) in &pairs {
        hasher.update(key_digest.as_str());
        hasher.update(value_digest.as_str());
    }
    DataVersion::from_digest(hasher.finalize())
}
