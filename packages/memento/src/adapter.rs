//! The cache lifecycle adapter.
//!
//! [`CacheAdapter`] implements [`ExecutionHooks`] and orchestrates the two
//! stores around graph execution: context-key lookups before a node runs,
//! fingerprinting and store writes after, resume pre-seeding before the
//! graph, and store release after it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use color_eyre::{Result, eyre::eyre};
use tracing::{debug, error, instrument, warn};

use crate::context::encode_context;
use crate::error::StoreError;
use crate::fingerprint::{Fingerprint, hash_value};
use crate::graph::{ALWAYS_RECOMPUTE_TAG, CACHE_TAG, DONT_FINGERPRINT_TAG, Graph, TagValue};
use crate::hooks::{ExecutionHooks, NodeCallable, NodeKwargs};
use crate::store::format::{FormatRegistry, Persist};
use crate::store::metadata::{MetadataStore, SqliteMetadataStore};
use crate::store::result::FileResultStore;
use crate::value::Value;

/// Which prior run to pre-seed fingerprints from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResumeFrom {
    /// The most recent run in history.
    Latest,
    /// A specific run id.
    Run(String),
}

/// Content-addressed execution cache, registered with the host engine as a
/// set of lifecycle hooks.
pub struct CacheAdapter {
    metadata_store: Box<dyn MetadataStore>,
    result_store: FileResultStore,
    resume_from: Option<ResumeFrom>,

    run_id: String,
    /// Node name -> fingerprint, for the current run.
    fingerprints: BTreeMap<String, Fingerprint>,
    /// Node name -> code version, snapshotted from the graph.
    code_versions: BTreeMap<String, String>,
    /// Node name -> engine-supplied descriptor blob.
    descriptors: BTreeMap<String, serde_json::Value>,
    /// Node name -> persistence mode, from `cache=<format>` tags.
    data_savers: BTreeMap<String, Persist>,
    /// Nodes to fingerprint but never serve from cache.
    always_recompute: BTreeSet<String>,
    /// Nodes treated as constants: any prior execution of the same code
    /// version matches, regardless of dependencies.
    constant_fingerprint: BTreeSet<String>,
}

impl CacheAdapter {
    /// The durable default: SQLite metadata and file-backed results under
    /// `root`, with the built-in formats registered.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let metadata_store = SqliteMetadataStore::open(&root)?;
        let result_store = FileResultStore::new(&root, FormatRegistry::with_defaults());
        Ok(Self::with_stores(Box::new(metadata_store), result_store))
    }

    /// Build an adapter over explicit stores.
    pub fn with_stores(
        metadata_store: Box<dyn MetadataStore>,
        result_store: FileResultStore,
    ) -> Self {
        Self {
            metadata_store,
            result_store,
            resume_from: None,
            run_id: String::new(),
            fingerprints: BTreeMap::new(),
            code_versions: BTreeMap::new(),
            descriptors: BTreeMap::new(),
            data_savers: BTreeMap::new(),
            always_recompute: BTreeSet::new(),
            constant_fingerprint: BTreeSet::new(),
        }
    }

    /// Pre-seed the next execution's fingerprints from a prior run.
    pub fn resume_from(mut self, resume_from: ResumeFrom) -> Self {
        self.resume_from = Some(resume_from);
        self
    }

    /// Declare nodes to fingerprint but never serve from cache, ahead of
    /// any tags.
    pub fn always_recompute(
        mut self,
        nodes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.always_recompute
            .extend(nodes.into_iter().map(Into::into));
        self
    }

    /// Declare nodes treated as constants, ahead of any tags.
    pub fn dont_fingerprint(
        mut self,
        nodes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.constant_fingerprint
            .extend(nodes.into_iter().map(Into::into));
        self
    }

    /// The fingerprints recorded so far in the current run.
    pub fn fingerprints(&self) -> &BTreeMap<String, Fingerprint> {
        &self.fingerprints
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn metadata_store(&mut self) -> &mut dyn MetadataStore {
        &mut *self.metadata_store
    }

    pub fn result_store(&mut self) -> &mut FileResultStore {
        &mut self.result_store
    }

    /// Build the lookup key for a node invocation from its code version and
    /// the fingerprints of its dependency inputs. Constant nodes are keyed
    /// by code version alone.
    fn context_key_for(&self, node_name: &str, node_kwargs: &NodeKwargs) -> Result<String> {
        let code_version = self.code_version_of(node_name)?;

        if self.constant_fingerprint.contains(node_name) {
            return encode_context(code_version, &[]);
        }

        let mut dependencies = Vec::with_capacity(node_kwargs.len());
        for dep_name in node_kwargs.keys() {
            let fingerprint = self.fingerprints.get(dep_name).ok_or_else(|| {
                eyre!(
                    "no fingerprint recorded for `{dep_name}`, dependency of `{node_name}`; \
                     nodes must execute in topological order"
                )
            })?;
            dependencies.push(fingerprint.clone());
        }

        encode_context(code_version, &dependencies)
    }

    fn code_version_of(&self, node_name: &str) -> Result<&str> {
        self.code_versions
            .get(node_name)
            .map(String::as_str)
            .ok_or_else(|| eyre!("node `{node_name}` is not part of the current graph"))
    }

    fn parse_node_tags(&mut self, graph: &Graph) {
        for node in graph.nodes() {
            if let Some(format) = node.cache_format() {
                let extra = node
                    .tags
                    .iter()
                    .filter(|(name, _)| name.as_str() != CACHE_TAG)
                    .filter_map(|(name, value)| match value {
                        TagValue::Str(v) => Some((name.clone(), v.clone())),
                        TagValue::Bool(_) => None,
                    })
                    .collect();
                self.data_savers.insert(
                    node.name.clone(),
                    Persist::SideChannel {
                        format: format.to_string(),
                        extra,
                    },
                );
            }
            if node.bool_tag(ALWAYS_RECOMPUTE_TAG) {
                self.always_recompute.insert(node.name.clone());
            }
            if node.bool_tag(DONT_FINGERPRINT_TAG) {
                self.constant_fingerprint.insert(node.name.clone());
            }
        }
    }

    /// Resolve `resume_from` to a concrete run and load that run's
    /// fingerprints as pre-seeded overrides.
    fn resolve_resume(&mut self) -> Result<()> {
        let Some(resume_from) = &self.resume_from else {
            return Ok(());
        };

        let run_id = match resume_from {
            ResumeFrom::Latest => self.metadata_store.latest_run_id()?,
            ResumeFrom::Run(run_id) => run_id.clone(),
        };

        let seeded = self.metadata_store.get_run_metadata(&run_id)?;
        debug!(%run_id, nodes = seeded.len(), "pre-seeded fingerprints from prior run");
        self.fingerprints.extend(seeded);
        Ok(())
    }

    /// Inputs use a synthetic code version so their context keys stay
    /// invariant across code changes.
    fn process_inputs(&mut self, inputs: &BTreeMap<String, Value>) {
        for (node_name, value) in inputs {
            let fingerprint = Fingerprint::new(
                node_name.clone(),
                format!("{node_name}__input"),
                hash_value(value),
            );
            self.fingerprints.insert(node_name.clone(), fingerprint);
        }
    }

    /// Overrides are fingerprinted so downstream keys are stable, but not
    /// written to metadata: the node did not actually execute.
    fn process_overrides(&mut self, overrides: &BTreeMap<String, Value>) -> Result<()> {
        for (node_name, value) in overrides {
            let code_version = self.code_version_of(node_name)?.to_string();
            let fingerprint =
                Fingerprint::new(node_name.clone(), code_version, hash_value(value));
            self.fingerprints.insert(node_name.clone(), fingerprint);
        }
        Ok(())
    }

    /// Fingerprint the recomputed result of an `always_recompute` node. The
    /// stored mapping keeps its first value (a conflicting rewrite would
    /// violate the one-value-per-context invariant); the in-memory
    /// fingerprint follows the actual result so downstream keys do.
    fn record_recomputed(
        &mut self,
        node_name: &str,
        context_key: &str,
        result: &Value,
    ) -> Result<()> {
        let code_version = self.code_version_of(node_name)?.to_string();
        let fingerprint =
            Fingerprint::new(node_name, code_version.clone(), hash_value(result));

        match self.metadata_store.get(&code_version, context_key)? {
            Some(existing) if existing.data == fingerprint.data => {}
            Some(existing) => {
                warn!(
                    %node_name,
                    cached = %existing.data,
                    recomputed = %fingerprint.data,
                    "recomputed value diverges from cached metadata; keeping the first mapping"
                );
            }
            None => {
                self.write_both_stores(&fingerprint, context_key, result)?;
            }
        }

        self.fingerprints
            .insert(node_name.to_string(), fingerprint);
        Ok(())
    }

    /// Write the result store then the metadata store for a freshly computed
    /// value. A failed side-channel materialization loses the result from
    /// the cache but does not fail the run.
    fn write_both_stores(
        &mut self,
        fingerprint: &Fingerprint,
        context_key: &str,
        result: &Value,
    ) -> Result<()> {
        let node_name = &fingerprint.node_name;
        let persist = self
            .data_savers
            .get(node_name)
            .cloned()
            .unwrap_or_default();

        if let Err(err) = self.result_store.set(&fingerprint.data, result, &persist) {
            match err {
                StoreError::Materialization { .. } => {
                    error!(%node_name, %err, "failed to materialize result; not caching this node");
                    return Ok(());
                }
                err => return Err(err.into()),
            }
        }

        let descriptor = self
            .descriptors
            .get(node_name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let run_id = self.run_id.clone();
        self.metadata_store
            .set(fingerprint, context_key, &descriptor, &run_id)?;
        Ok(())
    }
}

impl ExecutionHooks for CacheAdapter {
    #[instrument(name = "CacheAdapter::before_graph", skip(self, graph, inputs, overrides))]
    fn before_graph(
        &mut self,
        run_id: &str,
        graph: &Graph,
        inputs: &BTreeMap<String, Value>,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<()> {
        self.metadata_store.initialize()?;
        self.result_store.open()?;

        self.run_id = run_id.to_string();
        // Code versions aren't expected to change for the lifetime of the
        // host driver, but both snapshots are reset per execution anyway.
        self.code_versions = graph
            .nodes()
            .map(|node| (node.name.clone(), node.version.clone()))
            .collect();
        self.descriptors = graph
            .nodes()
            .map(|node| (node.name.clone(), node.descriptor.clone()))
            .collect();
        self.fingerprints.clear();

        self.parse_node_tags(graph);
        self.resolve_resume()?;

        self.process_inputs(inputs);
        self.process_overrides(overrides)?;
        Ok(())
    }

    #[instrument(
        name = "CacheAdapter::to_execute_node",
        skip(self, node_callable, node_kwargs)
    )]
    fn to_execute_node(
        &mut self,
        node_name: &str,
        node_callable: &NodeCallable<'_>,
        node_kwargs: &NodeKwargs,
    ) -> Result<Value> {
        let context_key = self.context_key_for(node_name, node_kwargs)?;
        let code_version = self.code_version_of(node_name)?.to_string();

        if self.always_recompute.contains(node_name) {
            debug!(%node_name, "always recompute");
            return node_callable(node_kwargs);
        }

        // Check in-memory fingerprints first: inputs, overrides, resume,
        // and nodes already visited this run (e.g. a node with many
        // children) all land there.
        let mut fingerprint = self.fingerprints.get(node_name).cloned();
        if fingerprint.is_none() {
            fingerprint = self.metadata_store.get(&code_version, &context_key)?;
        }

        let Some(fingerprint) = fingerprint else {
            debug!(%node_name, "cache miss");
            return node_callable(node_kwargs);
        };

        match self.result_store.get(&fingerprint.data) {
            Ok(result) => {
                debug!(%node_name, "cache hit");
                Ok(result)
            }
            Err(err @ StoreError::ResultRetrieval { .. }) => {
                // Metadata references a result the result store no longer
                // has. Invalidate the metadata for this code version and
                // recompute; the after-node hook repopulates both stores.
                error!(%node_name, %err, "cache desync detected; invalidating and recomputing");
                self.metadata_store.delete(&fingerprint)?;
                node_callable(node_kwargs)
            }
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(name = "CacheAdapter::after_node", skip(self, node_kwargs, result))]
    fn after_node(
        &mut self,
        node_name: &str,
        node_kwargs: &NodeKwargs,
        result: &Value,
    ) -> Result<()> {
        let context_key = self.context_key_for(node_name, node_kwargs)?;
        let code_version = self.code_version_of(node_name)?.to_string();

        if self.always_recompute.contains(node_name) {
            return self.record_recomputed(node_name, &context_key, result);
        }

        let fingerprint = match self.metadata_store.get(&code_version, &context_key)? {
            // Already cached: reuse the recorded fingerprint, don't grow
            // the result store.
            Some(fingerprint) => fingerprint,
            None => {
                let fingerprint =
                    Fingerprint::new(node_name, code_version, hash_value(result));
                self.write_both_stores(&fingerprint, &context_key, result)?;
                fingerprint
            }
        };

        self.fingerprints
            .insert(node_name.to_string(), fingerprint);
        Ok(())
    }

    #[instrument(name = "CacheAdapter::after_graph", skip(self))]
    fn after_graph(&mut self) -> Result<()> {
        self.result_store.close();
        self.metadata_store.close()?;
        Ok(())
    }
}
