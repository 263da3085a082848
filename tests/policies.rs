mod common;
use common::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use stategraph::config::RunConfig;
use stategraph::node::PregelNode;
use stategraph::pregel::{CachePolicy, GraphError, GraphInput, InMemoryCache, RetryPolicy};
use stategraph::types::ChannelWrite;

fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::attempts(max_attempts)
        .with_initial_interval(Duration::from_millis(1))
        .with_jitter(false)
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let graph = last_value_graph()
        .add_node(
            PregelNode::new(
                "flaky",
                Arc::new(FlakyNode {
                    attempts: attempts.clone(),
                    failures_before_success: 2,
                    writes: vec![ChannelWrite::new("output", json!("finally"))],
                }),
            )
            .with_triggers(["input"])
            .with_channels(["input"])
            .with_retry_policy(quick_retry(3)),
        )
        .build()
        .unwrap();

    let output = graph
        .invoke(
            GraphInput::values([("input", json!(1))]),
            RunConfig::default(),
        )
        .await
        .unwrap();
    assert_eq!(output.values["output"], json!("finally"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_exhaust_and_propagate() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let graph = last_value_graph()
        .add_node(
            PregelNode::new(
                "flaky",
                Arc::new(FlakyNode {
                    attempts: attempts.clone(),
                    failures_before_success: 10,
                    writes: vec![],
                }),
            )
            .with_triggers(["input"])
            .with_channels(["input"])
            .with_retry_policy(quick_retry(2)),
        )
        .build()
        .unwrap();

    let err = graph
        .invoke(
            GraphInput::values([("input", json!(1))]),
            RunConfig::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Node { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn non_matching_kinds_fail_fast() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let graph = last_value_graph()
        .add_node(
            PregelNode::new(
                "flaky",
                Arc::new(FlakyNode {
                    attempts: attempts.clone(),
                    failures_before_success: 10,
                    writes: vec![],
                }),
            )
            .with_triggers(["input"])
            .with_channels(["input"])
            // FlakyNode raises provider errors; only validation retries.
            .with_retry_policy(quick_retry(5).on_kinds(["validation"])),
        )
        .build()
        .unwrap();

    let err = graph
        .invoke(
            GraphInput::values([("input", json!(1))]),
            RunConfig::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Node { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cached_tasks_replay_without_executing() {
    let runs = Arc::new(AtomicUsize::new(0));
    let graph = last_value_graph()
        .add_node(
            PregelNode::new(
                "expensive",
                Arc::new(CountingNode {
                    runs: runs.clone(),
                    inner: |input: serde_json::Value,
                            _ctx: stategraph::node::NodeContext|
                     -> Result<stategraph::node::NodeUpdate, stategraph::node::NodeError> {
                        Ok(stategraph::node::NodeUpdate::write(
                            "output",
                            json!(format!("computed {}", input.as_i64().unwrap_or(0))),
                        ))
                    },
                }),
            )
            .with_triggers(["input"])
            .with_channels(["input"])
            .with_cache_policy(CachePolicy::default()),
        )
        .with_cache(Arc::new(InMemoryCache::new()))
        .build()
        .unwrap();

    for _ in 0..2 {
        let output = graph
            .invoke(
                GraphInput::values([("input", json!(7))]),
                RunConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(output.values["output"], json!("computed 7"));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1, "second run hit the cache");

    // A different input misses the cache.
    graph
        .invoke(
            GraphInput::values([("input", json!(8))]),
            RunConfig::default(),
        )
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expired_cache_entries_recompute() {
    let runs = Arc::new(AtomicUsize::new(0));
    let graph = last_value_graph()
        .add_node(
            PregelNode::new(
                "expensive",
                Arc::new(CountingNode {
                    runs: runs.clone(),
                    inner: |_input: serde_json::Value,
                            _ctx: stategraph::node::NodeContext|
                     -> Result<stategraph::node::NodeUpdate, stategraph::node::NodeError> {
                        Ok(stategraph::node::NodeUpdate::write("output", json!("v")))
                    },
                }),
            )
            .with_triggers(["input"])
            .with_channels(["input"])
            .with_cache_policy(CachePolicy::with_ttl(Duration::from_millis(0))),
        )
        .with_cache(Arc::new(InMemoryCache::new()))
        .build()
        .unwrap();

    for _ in 0..2 {
        graph
            .invoke(
                GraphInput::values([("input", json!(1))]),
                RunConfig::default(),
            )
            .await
            .unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2, "zero ttl never hits");
}
