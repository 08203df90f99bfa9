//! Lifecycle hooks driven by the host execution engine.
//!
//! The engine calls [`ExecutionHooks::before_graph`] once per graph
//! execution, then for every node in topological order calls
//! [`ExecutionHooks::to_execute_node`] in place of direct execution followed
//! by [`ExecutionHooks::after_node`], and finally
//! [`ExecutionHooks::after_graph`] during teardown. A hook set is a plain
//! capability: one struct implementing the four callbacks.

use std::collections::BTreeMap;

use color_eyre::Result;

use crate::graph::Graph;
use crate::value::Value;

/// A node's resolved keyword arguments: dependency name -> value.
pub type NodeKwargs = BTreeMap<String, Value>;

/// The node's computation, resolved by the host engine.
///
/// Errors returned by the callable are the node's own; the cache propagates
/// them unchanged.
pub type NodeCallable<'a> = dyn Fn(&NodeKwargs) -> Result<Value> + 'a;

/// Lifecycle hooks invoked around graph and node execution.
pub trait ExecutionHooks {
    /// Called once before the graph executes, with the values supplied as
    /// top-level inputs and as overrides (nodes the engine will not run).
    fn before_graph(
        &mut self,
        run_id: &str,
        graph: &Graph,
        inputs: &BTreeMap<String, Value>,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<()>;

    /// Called in place of direct node execution. The implementation decides
    /// whether to invoke `node_callable` or to produce the value some other
    /// way (e.g. from a cache).
    fn to_execute_node(
        &mut self,
        node_name: &str,
        node_callable: &NodeCallable<'_>,
        node_kwargs: &NodeKwargs,
    ) -> Result<Value>;

    /// Called after a node's result is available, whether computed or
    /// replayed.
    fn after_node(
        &mut self,
        node_name: &str,
        node_kwargs: &NodeKwargs,
        result: &Value,
    ) -> Result<()>;

    /// Called during graph-execution teardown.
    fn after_graph(&mut self) -> Result<()>;
}
