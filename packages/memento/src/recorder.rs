//! Fingerprint recorder, a developer tool orthogonal to the main cache.
//!
//! Records `{node name -> data version}` for every run and, when configured
//! with a path, dumps it as JSON to `<path>/fingerprints/<run_id>.json` for
//! inspection.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use color_eyre::{Result, eyre::Context as _};
use tracing::{debug, instrument};

use crate::fingerprint::{DataVersion, hash_value};
use crate::graph::Graph;
use crate::hooks::{ExecutionHooks, NodeCallable, NodeKwargs};
use crate::value::Value;

/// Fingerprints node results as they are produced.
#[derive(Debug, Default)]
pub struct FingerprintRecorder {
    path: Option<PathBuf>,
    fingerprints: BTreeMap<String, DataVersion>,
    run_id: String,
}

impl FingerprintRecorder {
    /// A recorder that only keeps fingerprints in memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that also dumps each run's fingerprints as JSON under
    /// `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// The fingerprints recorded so far in the current run.
    pub fn fingerprints(&self) -> &BTreeMap<String, DataVersion> {
        &self.fingerprints
    }
}

impl ExecutionHooks for FingerprintRecorder {
    /// Inputs and overrides don't pass through the node hooks, so they are
    /// fingerprinted up front.
    fn before_graph(
        &mut self,
        run_id: &str,
        _graph: &Graph,
        inputs: &BTreeMap<String, Value>,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<()> {
        self.run_id = run_id.to_string();
        self.fingerprints.clear();

        for (node_name, value) in inputs.iter().chain(overrides) {
            self.fingerprints
                .insert(node_name.clone(), hash_value(value));
        }
        Ok(())
    }

    /// Pass-through: the recorder never short-circuits execution.
    fn to_execute_node(
        &mut self,
        _node_name: &str,
        node_callable: &NodeCallable<'_>,
        node_kwargs: &NodeKwargs,
    ) -> Result<Value> {
        node_callable(node_kwargs)
    }

    fn after_node(
        &mut self,
        node_name: &str,
        _node_kwargs: &NodeKwargs,
        result: &Value,
    ) -> Result<()> {
        // Values passed as inputs or overrides already have known hashes.
        if !self.fingerprints.contains_key(node_name) {
            self.fingerprints
                .insert(node_name.to_string(), hash_value(result));
        }
        Ok(())
    }

    #[instrument(name = "FingerprintRecorder::after_graph", skip(self))]
    fn after_graph(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let dir = path.join("fingerprints");
        fs::create_dir_all(&dir)
            .with_context(|| format!("create fingerprint dump directory {dir:?}"))?;

        let file_path = dir.join(format!("{}.json", self.run_id));
        let dump = serde_json::to_string(&self.fingerprints).context("serialize fingerprints")?;
        fs::write(&file_path, dump)
            .with_context(|| format!("write fingerprint dump {file_path:?}"))?;
        debug!(?file_path, nodes = self.fingerprints.len(), "dumped run fingerprints");
        Ok(())
    }
}
