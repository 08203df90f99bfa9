//! Metadata stores: persistent `context key -> fingerprint` mappings plus
//! the run-history index supporting "latest run" and "resume from run".
//!
//! [`SqliteMetadataStore`] is the durable implementation;
//! [`InMemoryMetadataStore`] serves tests and ephemeral runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension as _, params};
use tracing::{instrument, trace};

use crate::error::StoreError;
use crate::fingerprint::{DataVersion, Fingerprint};

/// Database file name under the cache root.
const DB_FILE_NAME: &str = "metadata_store.db";

/// Persistent mapping `context key -> fingerprint` with a run-history index.
///
/// A `set` offering a different data version for an existing context key is
/// refused with [`StoreError::MetadataStoreIndexing`]: the same code version
/// and dependency fingerprints should always produce the same value, and a
/// conflict indicates non-determinism in the node function.
pub trait MetadataStore {
    /// Create tables/connections. Must be called before the first operation
    /// and again after `close`. Idempotent.
    fn initialize(&mut self) -> Result<(), StoreError>;

    /// Record that executing `to.code` against `context_key` produced
    /// `to.data`. Offering the same data again is a no-op (a history row is
    /// still appended); offering different data is refused.
    fn set(
        &mut self,
        to: &Fingerprint,
        context_key: &str,
        node_descriptor: &serde_json::Value,
        run_id: &str,
    ) -> Result<(), StoreError>;

    /// Look up the fingerprint recorded for `context_key`. Bumps the hit or
    /// miss counter.
    fn get(
        &mut self,
        to_code: &str,
        context_key: &str,
    ) -> Result<Option<Fingerprint>, StoreError>;

    /// Remove all metadata rows whose code version is `to.code`. Used to
    /// recover when metadata references a result the result store no longer
    /// has.
    fn delete(&mut self, to: &Fingerprint) -> Result<(), StoreError>;

    /// The fingerprints recorded during `run_id`, keyed by node name.
    fn get_run_metadata(
        &mut self,
        run_id: &str,
    ) -> Result<BTreeMap<String, Fingerprint>, StoreError>;

    /// The run id of the most recent metadata write.
    fn latest_run_id(&mut self) -> Result<String, StoreError>;

    /// The fingerprints of the most recent run.
    fn get_latest_run(&mut self) -> Result<BTreeMap<String, Fingerprint>, StoreError> {
        let run_id = self.latest_run_id()?;
        self.get_run_metadata(&run_id)
    }

    /// Drop all stored metadata and counters.
    fn reset(&mut self) -> Result<(), StoreError>;

    /// Number of context keys stored.
    fn size(&mut self) -> Result<usize, StoreError>;

    fn empty(&mut self) -> Result<bool, StoreError> {
        Ok(self.size()? == 0)
    }

    fn hits(&self) -> u64;

    fn misses(&self) -> u64;

    /// Release the backing connection. `initialize` re-opens it.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// SQLite-backed metadata store.
///
/// Three tables in one embedded database:
/// - `nodes`: node descriptor per code version, for reconstruction
/// - `history`: append-only log of metadata writes; its autoincrement id
///   totally orders writes within a process and defines "latest run"
/// - `cache_metadata`: the `context key -> data version` mapping itself
#[derive(derive_more::Debug)]
pub struct SqliteMetadataStore {
    /// `None` for the transient in-memory database used in tests.
    path: Option<PathBuf>,
    #[debug("<connection>")]
    conn: Option<Connection>,
    hits: u64,
    misses: u64,
}

impl SqliteMetadataStore {
    /// Open or create the database under the given cache root.
    #[instrument(name = "SqliteMetadataStore::open", skip(root))]
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        let path = root.join(DB_FILE_NAME);
        let conn = Connection::open(&path)?;

        Ok(Self {
            path: Some(path),
            conn: Some(conn),
            hits: 0,
            misses: 0,
        })
    }

    /// A transient database for tests and ephemeral runs. Closing it
    /// discards all state.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            path: None,
            conn: Some(Connection::open_in_memory()?),
            hits: 0,
            misses: 0,
        })
    }

    /// Path to the database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                code_version TEXT PRIMARY KEY,
                node_json TEXT
            );

            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                context_key TEXT,
                run_id TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,

                FOREIGN KEY (context_key) REFERENCES cache_metadata(context_key)
            );

            CREATE TABLE IF NOT EXISTS cache_metadata (
                context_key TEXT PRIMARY KEY,
                node_name TEXT NOT NULL,
                code_version TEXT NOT NULL,
                data_version TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,

                FOREIGN KEY (code_version) REFERENCES nodes(code_version)
            );
            "#,
        )?;
        Ok(())
    }
}

impl MetadataStore for SqliteMetadataStore {
    #[instrument(name = "SqliteMetadataStore::initialize", skip(self))]
    fn initialize(&mut self) -> Result<(), StoreError> {
        if self.conn.is_none() {
            self.conn = Some(match &self.path {
                Some(path) => Connection::open(path)?,
                None => Connection::open_in_memory()?,
            });
        }
        self.create_tables()
    }

    #[instrument(name = "SqliteMetadataStore::set", skip(self, to, node_descriptor))]
    fn set(
        &mut self,
        to: &Fingerprint,
        context_key: &str,
        node_descriptor: &serde_json::Value,
        run_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.as_mut().ok_or(StoreError::Closed)?;
        let tx = conn.transaction()?;

        // Refuse rewrites that would change the recorded data version.
        let existing: Option<String> = tx
            .query_row(
                "SELECT data_version FROM cache_metadata WHERE context_key = ?1",
                params![context_key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            if existing != to.data.as_str() {
                return Err(StoreError::MetadataStoreIndexing {
                    node_name: to.node_name.clone(),
                });
            }
        }

        tx.execute(
            "INSERT INTO history (context_key, run_id) VALUES (?1, ?2)",
            params![context_key, run_id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO nodes (code_version, node_json) VALUES (?1, ?2)",
            params![to.code, node_descriptor.to_string()],
        )?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO cache_metadata (
                context_key, node_name, code_version, data_version
            ) VALUES (?1, ?2, ?3, ?4)
            "#,
            params![context_key, to.node_name, to.code, to.data.as_str()],
        )?;

        tx.commit()?;
        trace!(node_name = %to.node_name, %run_id, "recorded metadata");
        Ok(())
    }

    #[instrument(name = "SqliteMetadataStore::get", skip(self, context_key))]
    fn get(
        &mut self,
        to_code: &str,
        context_key: &str,
    ) -> Result<Option<Fingerprint>, StoreError> {
        let row: Option<(String, String)> = self
            .conn()?
            .query_row(
                "SELECT node_name, data_version FROM cache_metadata WHERE context_key = ?1",
                params![context_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((node_name, data_version)) => {
                self.hits += 1;
                Ok(Some(Fingerprint::new(
                    node_name,
                    to_code,
                    DataVersion::new(data_version),
                )))
            }
            None => {
                self.misses += 1;
                Ok(None)
            }
        }
    }

    #[instrument(name = "SqliteMetadataStore::delete", skip(self, to))]
    fn delete(&mut self, to: &Fingerprint) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM cache_metadata WHERE code_version = ?1",
            params![to.code],
        )?;
        Ok(())
    }

    #[instrument(name = "SqliteMetadataStore::get_run_metadata", skip(self))]
    fn get_run_metadata(
        &mut self,
        run_id: &str,
    ) -> Result<BTreeMap<String, Fingerprint>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT
                cache_metadata.node_name,
                cache_metadata.code_version,
                cache_metadata.data_version
            FROM (SELECT * FROM history WHERE history.run_id = ?1) AS run_history
            JOIN cache_metadata ON run_history.context_key = cache_metadata.context_key
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut fingerprints = BTreeMap::new();
        for row in rows {
            let (node_name, code_version, data_version) = row?;
            fingerprints.insert(
                node_name.clone(),
                Fingerprint::new(node_name, code_version, DataVersion::new(data_version)),
            );
        }

        if fingerprints.is_empty() {
            return Err(StoreError::MissingRun {
                run_id: run_id.to_string(),
            });
        }
        Ok(fingerprints)
    }

    #[instrument(name = "SqliteMetadataStore::latest_run_id", skip(self))]
    fn latest_run_id(&mut self) -> Result<String, StoreError> {
        self.conn()?
            .query_row(
                "SELECT run_id FROM history ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::MissingRun {
                run_id: String::from("latest"),
            })
    }

    #[instrument(name = "SqliteMetadataStore::reset", skip(self))]
    fn reset(&mut self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            DROP TABLE IF EXISTS history;
            DROP TABLE IF EXISTS nodes;
            DROP TABLE IF EXISTS cache_metadata;
            "#,
        )?;
        self.hits = 0;
        self.misses = 0;
        self.create_tables()
    }

    fn size(&mut self) -> Result<usize, StoreError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(context_key) FROM cache_metadata",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn hits(&self) -> u64 {
        self.hits
    }

    fn misses(&self) -> u64 {
        self.misses
    }

    #[instrument(name = "SqliteMetadataStore::close", skip(self))]
    fn close(&mut self) -> Result<(), StoreError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, err)| StoreError::Database(err))?;
        }
        Ok(())
    }
}

/// In-memory metadata store: a two-level map `code version -> context key ->
/// data version` plus a name side map and hit/miss counters.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    state: BTreeMap<String, BTreeMap<String, String>>,
    code_to_name: BTreeMap<String, String>,
    /// Context key -> fingerprint, for run-history queries.
    by_context: BTreeMap<String, Fingerprint>,
    history: Vec<HistoryEntry>,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
struct HistoryEntry {
    context_key: String,
    run_id: String,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with pre-existing state, as if prior runs had written
    /// it. `code_to_name` must cover every code version in `state`.
    pub fn with_state(
        state: BTreeMap<String, BTreeMap<String, String>>,
        code_to_name: BTreeMap<String, String>,
    ) -> Self {
        Self {
            state,
            code_to_name,
            ..Self::default()
        }
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn initialize(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn set(
        &mut self,
        to: &Fingerprint,
        context_key: &str,
        _node_descriptor: &serde_json::Value,
        run_id: &str,
    ) -> Result<(), StoreError> {
        let executions = self.state.entry(to.code.clone()).or_default();
        if let Some(existing) = executions.get(context_key) {
            if existing != to.data.as_str() {
                return Err(StoreError::MetadataStoreIndexing {
                    node_name: to.node_name.clone(),
                });
            }
        }

        self.code_to_name
            .insert(to.code.clone(), to.node_name.clone());
        self.history.push(HistoryEntry {
            context_key: context_key.to_string(),
            run_id: run_id.to_string(),
        });
        executions
            .entry(context_key.to_string())
            .or_insert_with(|| to.data.as_str().to_string());
        self.by_context
            .entry(context_key.to_string())
            .or_insert_with(|| to.clone());
        Ok(())
    }

    fn get(
        &mut self,
        to_code: &str,
        context_key: &str,
    ) -> Result<Option<Fingerprint>, StoreError> {
        let data_version = self
            .state
            .get(to_code)
            .and_then(|executions| executions.get(context_key));
        let node_name = self.code_to_name.get(to_code);

        match (data_version, node_name) {
            (Some(data_version), Some(node_name)) => {
                self.hits += 1;
                Ok(Some(Fingerprint::new(
                    node_name.clone(),
                    to_code,
                    DataVersion::new(data_version.clone()),
                )))
            }
            _ => {
                self.misses += 1;
                Ok(None)
            }
        }
    }

    fn delete(&mut self, to: &Fingerprint) -> Result<(), StoreError> {
        self.state.remove(&to.code);
        self.by_context
            .retain(|_, fingerprint| fingerprint.code != to.code);
        Ok(())
    }

    fn get_run_metadata(
        &mut self,
        run_id: &str,
    ) -> Result<BTreeMap<String, Fingerprint>, StoreError> {
        let fingerprints: BTreeMap<String, Fingerprint> = self
            .history
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .filter_map(|entry| self.by_context.get(&entry.context_key))
            .map(|fingerprint| (fingerprint.node_name.clone(), fingerprint.clone()))
            .collect();

        if fingerprints.is_empty() {
            return Err(StoreError::MissingRun {
                run_id: run_id.to_string(),
            });
        }
        Ok(fingerprints)
    }

    fn latest_run_id(&mut self) -> Result<String, StoreError> {
        self.history
            .last()
            .map(|entry| entry.run_id.clone())
            .ok_or(StoreError::MissingRun {
                run_id: String::from("latest"),
            })
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.state.clear();
        self.code_to_name.clear();
        self.by_context.clear();
        self.history.clear();
        self.hits = 0;
        self.misses = 0;
        Ok(())
    }

    fn size(&mut self) -> Result<usize, StoreError> {
        Ok(self.state.values().map(BTreeMap::len).sum())
    }

    fn hits(&self) -> u64 {
        self.hits
    }

    fn misses(&self) -> u64 {
        self.misses
    }

    fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
