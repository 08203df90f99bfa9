//! End-to-end scenarios: graphs executed twice against the same on-disk
//! stores, exercising hits, misses, overrides, desync repair, and resume.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use memento::adapter::{CacheAdapter, ResumeFrom};
use memento::graph::{NodeInfo, TagValue};
use memento::hooks::ExecutionHooks;
use memento::value::Value;
use pretty_assertions::assert_eq as pretty_assert_eq;
use tempfile::TempDir;

use crate::{TestEngine, TestNode, counted, int_arg};

fn no_args() -> BTreeMap<String, Value> {
    BTreeMap::new()
}

#[test_log::test]
fn single_root_node_is_cached_across_runs() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let (count, callable) = counted(Value::from(1));
    let engine = TestEngine::new(vec![TestNode::new(NodeInfo::new("a", "A-1"), [], callable)]);

    let results = engine
        .execute(&mut adapter, "run-1", &no_args(), &no_args())
        .unwrap();
    pretty_assert_eq!(results["a"], Value::from(1));
    pretty_assert_eq!(adapter.result_store().size().unwrap(), 1);
    adapter.metadata_store().initialize().unwrap();
    pretty_assert_eq!(adapter.metadata_store().size().unwrap(), 1);
    pretty_assert_eq!(adapter.result_store().hits(), 0);

    let results = engine
        .execute(&mut adapter, "run-2", &no_args(), &no_args())
        .unwrap();
    pretty_assert_eq!(results["a"], Value::from(1));
    pretty_assert_eq!(count.get(), 1, "second run must be served from cache");
    pretty_assert_eq!(adapter.result_store().hits(), 1);
    pretty_assert_eq!(adapter.result_store().size().unwrap(), 1);
    adapter.metadata_store().initialize().unwrap();
    pretty_assert_eq!(adapter.metadata_store().size().unwrap(), 1);
}

#[test_log::test]
fn external_inputs_populate_fingerprints_but_not_the_result_store() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let (count, callable) = counted(Value::from(1));
    let engine = TestEngine::new(vec![TestNode::new(
        NodeInfo::new("a", "A-1"),
        ["external"],
        callable,
    )]);
    let inputs = BTreeMap::from([(String::from("external"), Value::from(0))]);

    engine
        .execute(&mut adapter, "run-1", &inputs, &no_args())
        .unwrap();
    // Only `a` is stored; the input is fingerprinted, not cached.
    pretty_assert_eq!(adapter.result_store().size().unwrap(), 1);

    engine
        .execute(&mut adapter, "run-2", &inputs, &no_args())
        .unwrap();
    pretty_assert_eq!(count.get(), 1);
    pretty_assert_eq!(adapter.result_store().hits(), 1);
}

#[test_log::test]
fn dependent_nodes_are_cached_and_replayed() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let (count_a, callable_a) = counted(Value::from(1));
    let engine = TestEngine::new(vec![
        TestNode::new(NodeInfo::new("a", "A-1"), [], callable_a),
        TestNode::new(NodeInfo::new("b", "B-1"), ["a"], |kwargs| {
            Ok(Value::from(int_arg(kwargs, "a")? + 3))
        }),
    ]);

    let first = engine
        .execute(&mut adapter, "run-1", &no_args(), &no_args())
        .unwrap();
    pretty_assert_eq!(first["b"], Value::from(4));
    pretty_assert_eq!(adapter.result_store().size().unwrap(), 2);

    let second = engine
        .execute(&mut adapter, "run-2", &no_args(), &no_args())
        .unwrap();
    pretty_assert_eq!(count_a.get(), 1);
    pretty_assert_eq!(adapter.result_store().hits(), 2);
    pretty_assert_eq!(first, second);
}

#[test_log::test]
fn overrides_key_downstream_nodes_but_are_not_written_to_metadata() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let count_b = Rc::new(Cell::new(0));
    let counter = Rc::clone(&count_b);
    let engine = TestEngine::new(vec![
        TestNode::new(NodeInfo::new("a", "A-1"), [], |_| Ok(Value::from(1))),
        TestNode::new(NodeInfo::new("b", "B-1"), ["a"], move |kwargs| {
            counter.set(counter.get() + 1);
            Ok(Value::from(int_arg(kwargs, "a")? + 3))
        }),
    ]);
    let overrides = BTreeMap::from([(String::from("a"), Value::from(7))]);

    let first = engine
        .execute(&mut adapter, "run-1", &no_args(), &overrides)
        .unwrap();
    pretty_assert_eq!(first["b"], Value::from(10));
    // Only `b` lands in either store: the overridden node never executed.
    pretty_assert_eq!(adapter.result_store().size().unwrap(), 1);
    adapter.metadata_store().initialize().unwrap();
    pretty_assert_eq!(adapter.metadata_store().size().unwrap(), 1);

    let second = engine
        .execute(&mut adapter, "run-2", &no_args(), &overrides)
        .unwrap();
    pretty_assert_eq!(second["b"], Value::from(10));
    pretty_assert_eq!(count_b.get(), 1, "identical override must replay `b`");
    pretty_assert_eq!(adapter.result_store().hits(), 1);
}

#[test_log::test]
fn desync_between_stores_recovers_without_surfacing() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let (count, callable) = counted(Value::from(1));
    let engine = TestEngine::new(vec![TestNode::new(NodeInfo::new("a", "A-1"), [], callable)]);

    engine
        .execute(&mut adapter, "run-1", &no_args(), &no_args())
        .unwrap();

    // Break the invariant: metadata still references the result, but the
    // result store no longer holds it.
    let data_version = adapter.fingerprints()["a"].data.clone();
    adapter.result_store().delete(&data_version).unwrap();

    engine
        .execute(&mut adapter, "run-2", &no_args(), &no_args())
        .unwrap();

    pretty_assert_eq!(count.get(), 2, "the node must recompute exactly once more");
    pretty_assert_eq!(adapter.result_store().size().unwrap(), 1);
    adapter.metadata_store().initialize().unwrap();
    pretty_assert_eq!(adapter.metadata_store().size().unwrap(), 1);

    // Third run is a clean hit again.
    engine
        .execute(&mut adapter, "run-3", &no_args(), &no_args())
        .unwrap();
    pretty_assert_eq!(count.get(), 2);
}

#[test_log::test]
fn resume_from_latest_preseeds_the_previous_runs_fingerprints() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let engine = TestEngine::new(vec![
        TestNode::new(NodeInfo::new("a", "A-1"), [], |_| Ok(Value::from(1))),
        TestNode::new(NodeInfo::new("b", "B-1"), ["a"], |kwargs| {
            Ok(Value::from(int_arg(kwargs, "a")? + 3))
        }),
    ]);

    engine
        .execute(&mut adapter, "run-1", &no_args(), &no_args())
        .unwrap();
    let recorded = adapter.fingerprints().clone();

    let mut resumed = CacheAdapter::new(dir.path())
        .unwrap()
        .resume_from(ResumeFrom::Latest);
    resumed
        .before_graph("run-2", &engine.graph(), &no_args(), &no_args())
        .unwrap();

    pretty_assert_eq!(resumed.fingerprints(), &recorded);
}

#[test_log::test]
fn resume_from_unknown_run_surfaces_missing_run() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path())
        .unwrap()
        .resume_from(ResumeFrom::Run(String::from("no-such-run")));

    let engine = TestEngine::new(vec![TestNode::new(NodeInfo::new("a", "A-1"), [], |_| {
        Ok(Value::from(1))
    })]);

    let err = engine
        .execute(&mut adapter, "run-1", &no_args(), &no_args())
        .unwrap_err();
    assert!(err.to_string().contains("not found in history"));
}

#[test_log::test]
fn cache_tag_writes_side_channel_files() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let value = Value::Mapping(vec![
        (Value::from("x"), Value::from(1)),
        (Value::from("y"), Value::from(2)),
    ]);
    let (count, callable) = counted(value.clone());
    let engine = TestEngine::new(vec![TestNode::new(
        NodeInfo::new("data", "DATA-1")
            .with_tag("cache", TagValue::Str(String::from("json"))),
        [],
        callable,
    )]);

    let first = engine
        .execute(&mut adapter, "run-1", &no_args(), &no_args())
        .unwrap();
    let data_version = adapter.fingerprints()["data"].data.clone();
    assert!(dir.path().join(format!("{data_version}.json")).exists());

    let second = engine
        .execute(&mut adapter, "run-2", &no_args(), &no_args())
        .unwrap();
    pretty_assert_eq!(count.get(), 1);
    pretty_assert_eq!(first["data"], value);
    pretty_assert_eq!(second["data"], value);
}

#[test_log::test]
fn always_recompute_nodes_never_replay_from_cache() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let (count, callable) = counted(Value::from(1));
    let engine = TestEngine::new(vec![TestNode::new(
        NodeInfo::new("a", "A-1").with_tag("always_recompute", TagValue::Bool(true)),
        [],
        callable,
    )]);

    engine
        .execute(&mut adapter, "run-1", &no_args(), &no_args())
        .unwrap();
    engine
        .execute(&mut adapter, "run-2", &no_args(), &no_args())
        .unwrap();

    pretty_assert_eq!(count.get(), 2, "the node must execute on every run");
    // The result is still fingerprinted and stored once.
    pretty_assert_eq!(adapter.result_store().size().unwrap(), 1);
    adapter.metadata_store().initialize().unwrap();
    pretty_assert_eq!(adapter.metadata_store().size().unwrap(), 1);
}

#[test_log::test]
fn dont_fingerprint_nodes_ignore_dependency_changes() {
    let dir = TempDir::new().unwrap();
    let mut adapter = CacheAdapter::new(dir.path()).unwrap();

    let count = Rc::new(Cell::new(0));
    let counter = Rc::clone(&count);
    let engine = TestEngine::new(vec![TestNode::new(
        NodeInfo::new("snapshot", "SNAP-1").with_tag("dont_fingerprint", TagValue::Bool(true)),
        ["external"],
        move |kwargs| {
            counter.set(counter.get() + 1);
            Ok(Value::from(int_arg(kwargs, "external")? + 100))
        },
    )]);

    let first_inputs = BTreeMap::from([(String::from("external"), Value::from(0))]);
    let first = engine
        .execute(&mut adapter, "run-1", &first_inputs, &no_args())
        .unwrap();

    // A changed input would normally re-key the node; a constant node keeps
    // serving the first observation.
    let second_inputs = BTreeMap::from([(String::from("external"), Value::from(999))]);
    let second = engine
        .execute(&mut adapter, "run-2", &second_inputs, &no_args())
        .unwrap();

    pretty_assert_eq!(count.get(), 1);
    pretty_assert_eq!(first["snapshot"], Value::from(100));
    pretty_assert_eq!(second["snapshot"], Value::from(100));
}
