//! File-backed result store.
//!
//! A persistent `data version -> value` map: a flat directory of entry files
//! under `<root>/result_store`, each named by its key. Data versions are
//! URL-safe base64, so keys double as file names. Entries either carry the
//! value inline or point at a side-channel file written by a registered
//! saver.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::error::{Cause, StoreError};
use crate::fingerprint::DataVersion;
use crate::store::format::{FormatRegistry, Persist};
use crate::value::Value;

/// Directory holding entry files, under the cache root.
const STORE_DIR_NAME: &str = "result_store";

/// One persisted entry.
#[derive(Debug, Serialize, Deserialize)]
enum StoredEntry {
    Inline(Value),
    /// Loader descriptor recorded in place of the value.
    SideChannel { format: String, path: PathBuf },
}

/// Persistent mapping `data version -> value`.
pub struct FileResultStore {
    directory: PathBuf,
    store_dir: PathBuf,
    registry: FormatRegistry,
    is_open: bool,
    hits: u64,
}

impl FileResultStore {
    /// Create a store rooted at `root`. Backing storage is opened lazily on
    /// first operation.
    pub fn new(root: impl Into<PathBuf>, registry: FormatRegistry) -> Self {
        let directory = root.into();
        let store_dir = directory.join(STORE_DIR_NAME);
        Self {
            directory,
            store_dir,
            registry,
            is_open: false,
            hits: 0,
        }
    }

    /// Path to the entry directory.
    pub fn path(&self) -> &Path {
        &self.store_dir
    }

    /// Number of successful retrievals.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Create backing storage. Idempotent.
    #[instrument(name = "FileResultStore::open", skip(self))]
    pub fn open(&mut self) -> Result<(), StoreError> {
        if !self.is_open {
            fs::create_dir_all(&self.store_dir)?;
            self.is_open = true;
        }
        Ok(())
    }

    /// Release backing storage. A later operation re-opens it.
    pub fn close(&mut self) {
        self.is_open = false;
    }

    /// Number of stored entries.
    pub fn size(&mut self) -> Result<usize, StoreError> {
        self.open()?;
        Ok(fs::read_dir(&self.store_dir)?.count())
    }

    pub fn empty(&mut self) -> Result<bool, StoreError> {
        Ok(self.size()? == 0)
    }

    /// Store a value under its data version. Idempotent: existing keys are
    /// left untouched.
    #[instrument(name = "FileResultStore::set", skip(self, value, persist))]
    pub fn set(
        &mut self,
        key: &DataVersion,
        value: &Value,
        persist: &Persist,
    ) -> Result<(), StoreError> {
        self.open()?;

        let entry_path = self.entry_path(key);
        if entry_path.exists() {
            trace!(%key, "key already stored");
            return Ok(());
        }

        let entry = match persist {
            Persist::Inline => StoredEntry::Inline(value.clone()),
            Persist::SideChannel { format, .. } => {
                let side_path = self.directory.join(format!("{key}.{format}"));
                self.materialize(format, value, &side_path)?;
                StoredEntry::SideChannel {
                    format: format.clone(),
                    path: side_path,
                }
            }
        };

        let serialized = serde_json::to_vec(&entry)?;
        fs::write(&entry_path, serialized)?;
        trace!(%key, "stored entry");
        Ok(())
    }

    /// Retrieve the value stored under `key`, reconstructing side-channel
    /// entries through their registered loader.
    #[instrument(name = "FileResultStore::get", skip(self))]
    pub fn get(&mut self, key: &DataVersion) -> Result<Value, StoreError> {
        self.open()?;

        let entry_path = self.entry_path(key);
        let serialized = fs::read(&entry_path).map_err(|err| retrieval(key, err))?;
        let entry: StoredEntry =
            serde_json::from_slice(&serialized).map_err(|err| retrieval(key, err))?;

        let value = match entry {
            StoredEntry::Inline(value) => value,
            StoredEntry::SideChannel { format, path } => self
                .registry
                .find(&format)
                .and_then(|f| f.load(&path))
                .map_err(|err| retrieval(key, err))?,
        };

        self.hits += 1;
        trace!(%key, "retrieved entry");
        Ok(value)
    }

    /// Remove the entry stored under `key`. An absent key is an error.
    #[instrument(name = "FileResultStore::delete", skip(self))]
    pub fn delete(&mut self, key: &DataVersion) -> Result<(), StoreError> {
        self.open()?;
        fs::remove_file(self.entry_path(key)).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                retrieval(key, err)
            } else {
                StoreError::Io(err)
            }
        })
    }

    /// Remove every entry.
    #[instrument(name = "FileResultStore::reset", skip(self))]
    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.open()?;
        for entry in fs::read_dir(&self.store_dir)? {
            fs::remove_file(entry?.path())?;
        }
        self.hits = 0;
        Ok(())
    }

    fn entry_path(&self, key: &DataVersion) -> PathBuf {
        self.store_dir.join(key.as_str())
    }

    fn materialize(
        &self,
        format: &str,
        value: &Value,
        path: &Path,
    ) -> Result<(), StoreError> {
        self.registry
            .lookup(format, value)
            .and_then(|f| f.save(value, path))
            .map_err(|err| StoreError::Materialization {
                format: format.to_string(),
                source: Box::new(err),
            })
    }
}

fn retrieval(key: &DataVersion, source: impl Into<Cause>) -> StoreError {
    StoreError::ResultRetrieval {
        key: key.as_str().to_string(),
        source: Some(source.into()),
    }
}
