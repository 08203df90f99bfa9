//! Reversible context-key encoding.
//!
//! A context key is the lookup key for one node invocation: the node's code
//! version paired with the data fingerprints of its dependency inputs. The
//! encoding is fully reversible so that stored keys can be decoded back for
//! inspection, and canonical so that two semantically equal dependency maps
//! produce byte-identical keys.
//!
//! The wire form is an interleaved string dict (`key value key value ...`,
//! sorted by key, single-space separators), deflate-compressed at level 3 and
//! rendered as URL-safe base64. Node names and fingerprints are required to
//! be space-free; fingerprints are base64 and node names are identifiers, so
//! both satisfy this.

use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use color_eyre::{
    Result,
    eyre::{Context as _, bail},
};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use itertools::Itertools as _;

use crate::fingerprint::Fingerprint;

/// Dependency payload for nodes without dependencies: top-level nodes
/// without inputs and overrides.
const EMPTY_DEPENDENCIES: &str = "<none>";

/// The decoded form of a context key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeContext {
    pub code_version: String,
    /// Dependency node name -> data fingerprint.
    pub dependencies: BTreeMap<String, String>,
}

/// Build the context key for a node invocation from its code version and the
/// fingerprints of its dependency inputs.
pub fn encode_context(code_version: &str, dependencies: &[Fingerprint]) -> Result<String> {
    let payload = if dependencies.is_empty() {
        EMPTY_DEPENDENCIES.to_string()
    } else {
        let map: BTreeMap<String, String> = dependencies
            .iter()
            .map(|dep| (dep.node_name.clone(), dep.data.as_str().to_string()))
            .collect();
        encode_map(&map)?
    };

    let outer = BTreeMap::from([(code_version.to_string(), payload)]);
    encode_map(&outer)
}

/// Decode a context key produced by [`encode_context`].
pub fn decode_context(context_key: &str) -> Result<NodeContext> {
    let outer = decode_map(context_key).context("decode outer context payload")?;

    // The only key of the outer pair is the code version.
    let mut entries = outer.into_iter();
    let (code_version, payload) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => bail!("malformed context key: expected a single code version"),
    };
    let dependencies = if payload == EMPTY_DEPENDENCIES {
        BTreeMap::new()
    } else {
        decode_map(&payload).context("decode dependency payload")?
    };

    Ok(NodeContext {
        code_version,
        dependencies,
    })
}

/// Encode a string map as a single compressed string.
pub fn encode_map(map: &BTreeMap<String, String>) -> Result<String> {
    compress_string(&encode_interleaved(map))
}

/// Decode a string produced by [`encode_map`].
pub fn decode_map(encoded: &str) -> Result<BTreeMap<String, String>> {
    decode_interleaved(&decompress_string(encoded)?)
}

/// Interleave keys and values, sorted by key, separated by single spaces.
fn encode_interleaved(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .flat_map(|(key, value)| [key.as_str(), value.as_str()])
        .join(" ")
}

fn decode_interleaved(text: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    let mut parts = text.split(' ');
    while let Some(key) = parts.next() {
        let Some(value) = parts.next() else {
            bail!("malformed interleaved payload: dangling key `{key}`");
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn compress_string(text: &str) -> Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(3));
    encoder
        .write_all(text.as_bytes())
        .context("deflate payload")?;
    let compressed = encoder.finish().context("finish deflate stream")?;
    Ok(URL_SAFE.encode(compressed))
}

fn decompress_string(encoded: &str) -> Result<String> {
    let compressed = URL_SAFE
        .decode(encoded)
        .context("decode base64 payload")?;
    let mut text = String::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_string(&mut text)
        .context("inflate payload")?;
    Ok(text)
}
