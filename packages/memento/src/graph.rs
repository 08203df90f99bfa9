//! The view of the host engine's graph consumed by the cache.
//!
//! Graph construction, node discovery, and topological ordering belong to
//! the host engine; the cache only reads node names, code versions, tags,
//! and the opaque node descriptor it persists alongside metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tag recognized on nodes: persist the result via a side-channel file in
/// the given format.
pub const CACHE_TAG: &str = "cache";
/// Tag recognized on nodes: fingerprint the result but never serve it from
/// cache.
pub const ALWAYS_RECOMPUTE_TAG: &str = "always_recompute";
/// Tag recognized on nodes: treat the node as a constant and reuse any prior
/// fingerprint for the same code version.
pub const DONT_FINGERPRINT_TAG: &str = "dont_fingerprint";

/// A tag value attached to a node by the host's configuration surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagValue {
    Str(String),
    Bool(bool),
}

/// One node of the dataflow graph, as the cache sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    /// Source-derived version string identifying the node's implementation.
    pub version: String,
    pub tags: BTreeMap<String, TagValue>,
    /// Engine-supplied serialized description of the node. Persisted with
    /// metadata, never interpreted.
    pub descriptor: serde_json::Value,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tags: BTreeMap::new(),
            descriptor: serde_json::Value::Null,
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: TagValue) -> Self {
        self.tags.insert(name.into(), value);
        self
    }

    pub fn with_descriptor(mut self, descriptor: serde_json::Value) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// The side-channel format requested via the `cache` tag, if any.
    pub fn cache_format(&self) -> Option<&str> {
        match self.tags.get(CACHE_TAG) {
            Some(TagValue::Str(format)) => Some(format),
            _ => None,
        }
    }

    /// Whether the named boolean tag is present and true.
    pub fn bool_tag(&self, name: &str) -> bool {
        matches!(self.tags.get(name), Some(TagValue::Bool(true)))
    }
}

/// The dataflow graph: an iterable collection of nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<NodeInfo>,
}

impl Graph {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }

    pub fn get(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl FromIterator<NodeInfo> for Graph {
    fn from_iter<I: IntoIterator<Item = NodeInfo>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Graph {
    type Item = &'a NodeInfo;
    type IntoIter = std::slice::Iter<'a, NodeInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
