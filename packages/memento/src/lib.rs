//! Content-addressed execution cache for dataflow graphs.
//!
//! A host engine evaluates nodes in topological order, where each node is a
//! pure function of its declared dependencies. This crate intercepts node
//! execution through a set of lifecycle hooks to fingerprint every produced
//! value, persist `(context -> fingerprint)` and `(fingerprint -> value)`
//! mappings across runs, and short-circuit re-execution when an equivalent
//! computation has already been performed.
//!
//! The main entrypoint is [`adapter::CacheAdapter`], a [`hooks::ExecutionHooks`]
//! capability registered with the engine. It is backed by two stores:
//!
//! - [`store::FileResultStore`]: persistent `data version -> value` map
//! - [`store::SqliteMetadataStore`]: persistent `context key -> fingerprint`
//!   map with a run-history index (an in-memory variant exists for tests and
//!   ephemeral runs)

pub mod adapter;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod hooks;
pub mod recorder;
pub mod store;
pub mod value;
