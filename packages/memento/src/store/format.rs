//! Saver/loader registry for side-channel persistence.
//!
//! Nodes tagged `cache=<format>` have their results written to typed files
//! instead of inline entries. The registry resolves `(format, value)` to a
//! saver/loader pair; it is an explicit handle passed to the result store
//! rather than process-wide state, so tests can build their own.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::StoreError;
use crate::value::Value;

/// How a result entry should be persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Persist {
    /// Serialize the value in-place with the store's general serializer.
    #[default]
    Inline,
    /// Write the value to a typed file via a registered saver and record a
    /// loader descriptor in its place.
    SideChannel {
        format: String,
        /// Extra saver arguments from the node's tags. Carried through to
        /// savers that want them; unused by the built-in formats.
        extra: BTreeMap<String, String>,
    },
}

impl Persist {
    pub fn side_channel(format: impl Into<String>) -> Self {
        Persist::SideChannel {
            format: format.into(),
            extra: BTreeMap::new(),
        }
    }
}

/// A saver/loader pair for one file format.
pub trait ValueFormat: Send + Sync {
    /// Format name, doubling as the file extension (e.g. `json`).
    fn name(&self) -> &str;

    /// Whether this pair can persist the given value.
    fn supports(&self, value: &Value) -> bool;

    /// Write the value to the file at `path`.
    fn save(&self, value: &Value, path: &Path) -> Result<(), StoreError>;

    /// Reconstruct a value from the file at `path`.
    fn load(&self, path: &Path) -> Result<Value, StoreError>;
}

/// Lookup of saver/loader pairs by format name and value type.
pub struct FormatRegistry {
    formats: Vec<Box<dyn ValueFormat>>,
}

impl FormatRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// A registry with the built-in formats registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(JsonFormat));
        registry
    }

    pub fn register(&mut self, format: Box<dyn ValueFormat>) {
        self.formats.push(format);
    }

    /// Find a pair registered under `format` that supports `value`.
    pub fn lookup(&self, format: &str, value: &Value) -> Result<&dyn ValueFormat, StoreError> {
        self.formats
            .iter()
            .map(|f| f.as_ref())
            .find(|f| f.name() == format && f.supports(value))
            .ok_or_else(|| StoreError::UnknownFormat {
                format: format.to_string(),
            })
    }

    /// Find a pair by name alone, for loading entries whose value type is
    /// not known until the file is read back.
    pub fn find(&self, format: &str) -> Result<&dyn ValueFormat, StoreError> {
        self.formats
            .iter()
            .map(|f| f.as_ref())
            .find(|f| f.name() == format)
            .ok_or_else(|| StoreError::UnknownFormat {
                format: format.to_string(),
            })
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// JSON saver/loader over the whole value model.
pub struct JsonFormat;

impl ValueFormat for JsonFormat {
    fn name(&self) -> &str {
        "json"
    }

    fn supports(&self, _value: &Value) -> bool {
        true
    }

    fn save(&self, value: &Value, path: &Path) -> Result<(), StoreError> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), value)?;
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Value, StoreError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
