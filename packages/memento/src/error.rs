//! Error taxonomy shared by the stores and matched by the adapter.

use thiserror::Error;

/// A boxed cause attached to a store failure.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Faults raised by the result and metadata stores.
///
/// The adapter recovers from [`StoreError::ResultRetrieval`] locally by
/// invalidating the corresponding metadata and recomputing; the other kinds
/// surface to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The result store could not return a value for a key it was expected
    /// to have, either because the key is absent or because a side-channel
    /// file could not be loaded.
    #[error("failed to retrieve result for data version `{key}`")]
    ResultRetrieval {
        key: String,
        #[source]
        source: Option<Cause>,
    },

    /// A side-channel saver failed. The node result is lost from the cache
    /// but execution continues.
    #[error("failed to materialize value in format `{format}`")]
    Materialization {
        format: String,
        #[source]
        source: Cause,
    },

    /// The same `(code version, context key)` was offered two different data
    /// versions. Indicates non-determinism in the node function.
    #[error(
        "context key for node `{node_name}` already maps to a different data version; \
         the node function is likely non-idempotent"
    )]
    MetadataStoreIndexing { node_name: String },

    /// `resume_from` referenced a run the history does not contain, or
    /// "latest" was requested on empty history.
    #[error("run `{run_id}` not found in history")]
    MissingRun { run_id: String },

    /// No registered saver/loader pair supports the requested format and
    /// value type.
    #[error("no saver/loader registered for format `{format}`")]
    UnknownFormat { format: String },

    /// The store was used after `close` without re-opening.
    #[error("store is closed")]
    Closed,

    #[error("metadata database error")]
    Database(#[from] rusqlite::Error),

    #[error("store I/O error")]
    Io(#[from] std::io::Error),

    #[error("store serialization error")]
    Serde(#[from] serde_json::Error),
}
