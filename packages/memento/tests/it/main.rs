//! Integration tests driving the cache through a miniature host engine.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use color_eyre::{
    Result,
    eyre::{bail, eyre},
};
use memento::graph::{Graph, NodeInfo};
use memento::hooks::{ExecutionHooks, NodeKwargs};
use memento::value::Value;

pub mod end_to_end;

/// One node of a test dataflow: static metadata plus its computation.
pub struct TestNode {
    pub info: NodeInfo,
    pub deps: Vec<String>,
    pub callable: Box<dyn Fn(&NodeKwargs) -> Result<Value>>,
}

impl TestNode {
    pub fn new(
        info: NodeInfo,
        deps: impl IntoIterator<Item = &'static str>,
        callable: impl Fn(&NodeKwargs) -> Result<Value> + 'static,
    ) -> Self {
        Self {
            info,
            deps: deps.into_iter().map(String::from).collect(),
            callable: Box::new(callable),
        }
    }
}

/// A miniature host engine: evaluates nodes in declaration (topological)
/// order, driving the lifecycle hooks the way the real engine would. Nodes
/// named in `inputs` or `overrides` are not executed.
pub struct TestEngine {
    pub nodes: Vec<TestNode>,
}

impl TestEngine {
    pub fn new(nodes: Vec<TestNode>) -> Self {
        Self { nodes }
    }

    pub fn graph(&self) -> Graph {
        self.nodes.iter().map(|node| node.info.clone()).collect()
    }

    pub fn execute(
        &self,
        hooks: &mut dyn ExecutionHooks,
        run_id: &str,
        inputs: &BTreeMap<String, Value>,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        let graph = self.graph();
        hooks.before_graph(run_id, &graph, inputs, overrides)?;

        let mut results: BTreeMap<String, Value> = BTreeMap::new();
        results.extend(inputs.clone());
        results.extend(overrides.clone());

        for node in &self.nodes {
            let name = &node.info.name;
            if results.contains_key(name) {
                continue;
            }

            let kwargs: NodeKwargs = node
                .deps
                .iter()
                .map(|dep| {
                    let value = results
                        .get(dep)
                        .cloned()
                        .ok_or_else(|| eyre!("dependency `{dep}` of `{name}` unresolved"))?;
                    Ok((dep.clone(), value))
                })
                .collect::<Result<_>>()?;

            let result = hooks.to_execute_node(name, &*node.callable, &kwargs)?;
            hooks.after_node(name, &kwargs, &result)?;
            results.insert(name.clone(), result);
        }

        hooks.after_graph()?;
        Ok(results)
    }
}

/// A callable returning a constant, paired with an invocation counter.
pub fn counted(value: Value) -> (Rc<Cell<usize>>, impl Fn(&NodeKwargs) -> Result<Value>) {
    let count = Rc::new(Cell::new(0));
    let counter = Rc::clone(&count);
    let callable = move |_: &NodeKwargs| {
        counter.set(counter.get() + 1);
        Ok(value.clone())
    };
    (count, callable)
}

/// Read an integer keyword argument.
pub fn int_arg(kwargs: &NodeKwargs, name: &str) -> Result<i64> {
    match kwargs.get(name) {
        Some(Value::Int(value)) => Ok(*value),
        other => bail!("expected integer for `{name}`, got {other:?}"),
    }
}
