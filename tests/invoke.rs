mod common;
use common::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use stategraph::channels::ChannelSpec;
use stategraph::checkpoint::{CheckpointSaver, InMemorySaver};
use stategraph::config::RunConfig;
use stategraph::node::{NodeUpdate, PregelNode};
use stategraph::pregel::{GraphError, GraphInput, Pregel};
use stategraph::types::{ChannelVersion, StreamMode};

#[tokio::test]
async fn fan_out_sums_to_six() {
    let saver = Arc::new(InMemorySaver::new());
    let graph = sum_graph(Some(saver.clone()));
    let output = graph
        .invoke(
            GraphInput::values([("start", json!(1))]),
            RunConfig::for_thread("t-sum"),
        )
        .await
        .unwrap();
    assert_eq!(output.values["total"], json!(6));
    assert!(!output.is_paused());

    // The total channel committed exactly one write across the run.
    let state = graph
        .get_state(&RunConfig::for_thread("t-sum"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.values["total"], json!(6));
    let tuple_versions = &state.metadata;
    assert_eq!(tuple_versions.source, stategraph::checkpoint::CheckpointSource::Loop);
}

#[tokio::test]
async fn total_version_increments_exactly_once() {
    let saver = Arc::new(InMemorySaver::new());
    let graph = sum_graph(Some(saver));
    graph
        .invoke(
            GraphInput::values([("start", json!(1))]),
            RunConfig::for_thread("t-versions"),
        )
        .await
        .unwrap();
    let history = graph
        .get_state_history(&RunConfig::for_thread("t-versions"), Default::default())
        .await
        .unwrap();
    let bumps = history
        .windows(2)
        .filter(|pair| {
            let newer = pair[0].values.get("total");
            let older = pair[1].values.get("total");
            newer != older
        })
        .count();
    assert_eq!(bumps, 1, "total changed in exactly one step");
}

#[tokio::test]
async fn plain_pipeline_runs_without_a_saver() {
    let counter = Arc::new(AtomicUsize::new(0));
    let graph = last_value_graph()
        .add_node(
            PregelNode::new(
                "echo",
                Arc::new(CountingNode {
                    runs: counter.clone(),
                    inner: |input: serde_json::Value,
                            _ctx: stategraph::node::NodeContext|
                     -> Result<NodeUpdate, stategraph::node::NodeError> {
                        Ok(NodeUpdate::write(
                            "output",
                            json!(format!("echo: {}", input.as_str().unwrap_or("?"))),
                        ))
                    },
                }),
            )
            .with_triggers(["input"])
            .with_channels(["input"]),
        )
        .build()
        .unwrap();

    let output = graph
        .invoke(
            GraphInput::values([("input", json!("hi"))]),
            RunConfig::default(),
        )
        .await
        .unwrap();
    assert_eq!(output.values["output"], json!("echo: hi"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cyclic_graph_hits_the_recursion_limit() {
    // ping writes its own trigger channel, so it re-triggers forever.
    let graph = Pregel::builder()
        .add_channel("loop", ChannelSpec::LastValue)
        .add_node(
            PregelNode::new(
                "ping",
                from_input(|input| {
                    let n = input.as_i64().unwrap_or(0);
                    vec![("loop".to_string(), json!(n + 1))]
                }),
            )
            .with_triggers(["loop"])
            .with_channels(["loop"]),
        )
        .build()
        .unwrap();

    let err = graph
        .invoke(
            GraphInput::values([("loop", json!(0))]),
            RunConfig::default().with_recursion_limit(5),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Recursion { limit: 5 }));
}

#[tokio::test]
async fn recursion_failure_keeps_last_completed_checkpoint() {
    let saver = Arc::new(InMemorySaver::new());
    let graph = Pregel::builder()
        .add_channel("loop", ChannelSpec::LastValue)
        .add_node(
            PregelNode::new(
                "ping",
                from_input(|input| {
                    let n = input.as_i64().unwrap_or(0);
                    vec![("loop".to_string(), json!(n + 1))]
                }),
            )
            .with_triggers(["loop"])
            .with_channels(["loop"]),
        )
        .with_saver(saver)
        .build()
        .unwrap();

    let config = RunConfig::for_thread("t-rec").with_recursion_limit(3);
    let err = graph
        .invoke(GraphInput::values([("loop", json!(0))]), config)
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Recursion { .. }));

    // Three loop steps committed; their state is queryable.
    let state = graph
        .get_state(&RunConfig::for_thread("t-rec"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.values["loop"], json!(3));
}

#[tokio::test]
async fn failing_node_propagates_after_writes() {
    let graph = last_value_graph()
        .add_node(
            PregelNode::new(
                "boom",
                Arc::new(FnNode(
                    |_input: serde_json::Value,
                     _ctx: stategraph::node::NodeContext|
                     -> Result<NodeUpdate, stategraph::node::NodeError> {
                        Err(stategraph::node::NodeError::Other("kaboom".into()))
                    },
                )),
            )
            .with_triggers(["input"])
            .with_channels(["input"]),
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
    match err {
        GraphError::Node { node, .. } => assert_eq!(node, "boom"),
        other => panic!("expected node error, got {other:?}"),
    }
}

#[tokio::test]
async fn stream_orders_step_events_and_filters_modes() {
    let saver = Arc::new(InMemorySaver::new());
    let graph = sum_graph(Some(saver));
    let stream = graph.stream(
        GraphInput::values([("start", json!(1))]),
        RunConfig::for_thread("t-stream")
            .with_stream_modes([StreamMode::Values, StreamMode::Updates]),
    );
    let (events, result) = stream.collect().await;
    result.unwrap();

    let mut steps_seen = Vec::new();
    for event in &events {
        match event {
            stategraph::event_bus::StreamEvent::Values { step, .. }
            | stategraph::event_bus::StreamEvent::Updates { step, .. } => {
                steps_seen.push(*step);
            }
            stategraph::event_bus::StreamEvent::Metadata { .. } => {}
            other => panic!("unexpected event family: {other:?}"),
        }
    }
    let mut sorted = steps_seen.clone();
    sorted.sort_unstable();
    assert_eq!(steps_seen, sorted, "step N events precede step N+1");
    assert!(steps_seen.contains(&0));
}

#[tokio::test]
async fn updates_stream_reports_node_writes() {
    let saver = Arc::new(InMemorySaver::new());
    let graph = sum_graph(Some(saver));
    let stream = graph.stream(
        GraphInput::values([("start", json!(1))]),
        RunConfig::for_thread("t-upd").with_stream_modes([StreamMode::Updates]),
    );
    let (events, result) = stream.collect().await;
    result.unwrap();

    let fan_update = events.iter().find_map(|event| match event {
        stategraph::event_bus::StreamEvent::Updates { updates, .. } => updates.get("fan").cloned(),
        _ => None,
    });
    let writes = fan_update.expect("fan produced an update event");
    assert_eq!(writes[0].channel, "xs");
    assert_eq!(writes[0].value, json!([1, 2, 3]));
}

#[tokio::test]
async fn versions_are_monotonic_across_history() {
    let saver = Arc::new(InMemorySaver::new());
    let graph = sum_graph(Some(saver.clone()));
    graph
        .invoke(
            GraphInput::values([("start", json!(1))]),
            RunConfig::for_thread("t-mono"),
        )
        .await
        .unwrap();

    let at = stategraph::checkpoint::CheckpointRef::new("t-mono", "");
    let tuple = saver.get_tuple(&at).await.unwrap().unwrap();
    for version in tuple.checkpoint.channel_versions.values() {
        assert!(*version > ChannelVersion::null());
    }
}
