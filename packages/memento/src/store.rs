//! Persistent stores backing the cache.
//!
//! Two stores cooperate: the metadata store maps `context key -> fingerprint`
//! and keeps the run-history index, while the result store maps
//! `data version -> value`. Every data version referenced by metadata should
//! have a corresponding result entry; the adapter tolerates and repairs
//! violations of that invariant.

pub mod format;
pub mod metadata;
pub mod result;

pub use format::{FormatRegistry, JsonFormat, Persist, ValueFormat};
pub use metadata::{InMemoryMetadataStore, MetadataStore, SqliteMetadataStore};
pub use result::FileResultStore;
