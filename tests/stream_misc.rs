mod common;
use common::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use stategraph::config::RunConfig;
use stategraph::event_bus::{MemorySink, StreamEvent};
use stategraph::node::{NodeContext, NodeError, NodeRunner, NodeUpdate, PregelNode};
use stategraph::pregel::GraphInput;
use stategraph::types::{INTERRUPT, StreamMode};

/// Emits a message chunk and a custom chunk before writing its output.
struct ChattyNode;

#[async_trait]
impl NodeRunner for ChattyNode {
    async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeUpdate, NodeError> {
        ctx.writer().message(json!("token-1")).await;
        ctx.writer().message(json!("token-2")).await;
        ctx.writer().custom(json!({"progress": 0.5})).await;
        Ok(NodeUpdate::write("output", json!("done")))
    }
}

#[tokio::test]
async fn message_and_custom_chunks_reach_the_stream() {
    let graph = last_value_graph()
        .add_node(
            PregelNode::new("chatty", Arc::new(ChattyNode))
                .with_triggers(["input"])
                .with_channels(["input"]),
        )
        .build()
        .unwrap();

    let stream = graph.stream(
        GraphInput::values([("input", json!(1))]),
        RunConfig::default().with_stream_modes([StreamMode::Messages, StreamMode::Custom]),
    );
    let (events, result) = stream.collect().await;
    result.unwrap();

    let messages: Vec<Value> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Messages { node, chunk, .. } => {
                assert_eq!(node, "chatty");
                Some(chunk.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec![json!("token-1"), json!("token-2")]);

    let customs: Vec<Value> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Custom { value, .. } => Some(value.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(customs, vec![json!({"progress": 0.5})]);
}

#[tokio::test]
async fn unselected_modes_are_filtered_from_the_run_stream() {
    let graph = last_value_graph()
        .add_node(
            PregelNode::new("chatty", Arc::new(ChattyNode))
                .with_triggers(["input"])
                .with_channels(["input"]),
        )
        .build()
        .unwrap();

    let stream = graph.stream(
        GraphInput::values([("input", json!(1))]),
        RunConfig::default().with_stream_modes([StreamMode::Values]),
    );
    let (events, result) = stream.collect().await;
    result.unwrap();
    assert!(
        events
            .iter()
            .all(|e| !matches!(e, StreamEvent::Messages { .. } | StreamEvent::Custom { .. }))
    );
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Values { .. })));
}

#[tokio::test]
async fn sinks_observe_events_regardless_of_stream_modes() {
    let sink = MemorySink::new();
    let graph = last_value_graph()
        .add_node(
            PregelNode::new("chatty", Arc::new(ChattyNode))
                .with_triggers(["input"])
                .with_channels(["input"]),
        )
        .with_event_sink(sink.clone())
        .build()
        .unwrap();

    graph
        .invoke(
            GraphInput::values([("input", json!(1))]),
            RunConfig::default().with_stream_modes(Vec::<StreamMode>::new()),
        )
        .await
        .unwrap();

    // Sink workers run asynchronously off a broadcast hub.
    let mut captured = Vec::new();
    for _ in 0..50 {
        captured = sink.snapshot();
        if captured
            .iter()
            .any(|e| matches!(e, StreamEvent::Values { .. }))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        captured
            .iter()
            .any(|e| matches!(e, StreamEvent::Messages { .. })),
        "bus delivers message chunks to sinks"
    );
    assert!(
        captured
            .iter()
            .any(|e| matches!(e, StreamEvent::Values { .. })),
        "bus delivers step values to sinks"
    );
}

#[tokio::test]
async fn interrupts_surface_on_the_updates_stream() {
    let graph = last_value_graph()
        .add_node(
            PregelNode::new(
                "ask",
                Arc::new(FnNode(|_input: Value, ctx: NodeContext| {
                    ctx.interrupt(json!("confirm?")).map(|_| NodeUpdate::empty())
                })),
            )
            .with_triggers(["input"])
            .with_channels(["input"]),
        )
        .build()
        .unwrap();

    let stream = graph.stream(
        GraphInput::values([("input", json!(1))]),
        RunConfig::default().with_stream_modes([StreamMode::Updates]),
    );
    let (events, result) = stream.collect().await;
    let output = result.unwrap();
    assert!(output.is_paused());

    let interrupt_update = events.iter().find_map(|event| match event {
        StreamEvent::Updates { updates, .. } => updates.get(INTERRUPT).cloned(),
        _ => None,
    });
    let writes = interrupt_update.expect("interrupt surfaced as an update");
    assert_eq!(writes[0].channel, INTERRUPT);
}
