mod common;
use common::*;

use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use stategraph::channels::{Channel, ChannelSpec};
use stategraph::checkpoint::{Checkpoint, PendingWrite};
use stategraph::node::PregelNode;
use stategraph::pregel::{TaskKind, deterministic_task_id, prepare_tasks, task_namespace};
use stategraph::types::{ChannelVersion, PUSH, RESUME, SendPacket};
use uuid::Uuid;

fn channels_for(specs: &[(&str, ChannelSpec)]) -> FxHashMap<String, Box<dyn Channel>> {
    specs
        .iter()
        .map(|(name, spec)| (name.to_string(), spec.build()))
        .collect()
}

fn two_nodes() -> FxHashMap<String, PregelNode> {
    let mut nodes = FxHashMap::default();
    for name in ["A", "B"] {
        nodes.insert(
            name.to_string(),
            PregelNode::new(name, fixed_writes([("out", json!(1))]))
                .with_triggers(["in"])
                .with_channels(["in"]),
        );
    }
    nodes
}

#[test]
fn push_task_ids_match_the_uuid5_formula() {
    let mut checkpoint = Checkpoint::empty();
    checkpoint.pending_sends = vec![
        SendPacket::new("A", json!({"x": 1})),
        SendPacket::new("B", json!({"y": 2})),
    ];
    let nodes = two_nodes();
    let channels = channels_for(&[("in", ChannelSpec::LastValue)]);

    let tasks = prepare_tasks(&checkpoint, &channels, &nodes, 3, "", &[]);
    assert_eq!(tasks.len(), 2);

    let namespace = Uuid::parse_str(&checkpoint.id).unwrap();
    let expected_a = Uuid::new_v5(&namespace, b"[\"A\",3,\"A\",\"__pregel_push__\",0]").to_string();
    let expected_b = Uuid::new_v5(&namespace, b"[\"B\",3,\"B\",\"__pregel_push__\",1]").to_string();
    assert_eq!(tasks[0].id, expected_a);
    assert_eq!(tasks[1].id, expected_b);
    assert_eq!(tasks[0].input, json!({"x": 1}));
    assert!(matches!(tasks[0].kind, TaskKind::Push { index: 0 }));
}

#[test]
fn re_preparation_yields_identical_ids() {
    let mut checkpoint = Checkpoint::empty();
    checkpoint.pending_sends = vec![SendPacket::new("A", json!(1))];
    checkpoint
        .channel_versions
        .insert("in".to_string(), ChannelVersion::Int(1));
    let nodes = two_nodes();
    // Make "in" readable so pull tasks resolve an input.
    let mut channels = channels_for(&[("in", ChannelSpec::LastValue)]);
    channels
        .get_mut("in")
        .unwrap()
        .update(vec![json!("seed")])
        .unwrap();

    let first = prepare_tasks(&checkpoint, &channels, &nodes, 2, "", &[]);
    let second = prepare_tasks(&checkpoint, &channels, &nodes, 2, "", &[]);
    let first_ids: Vec<&str> = first.iter().map(|t| t.id.as_str()).collect();
    let second_ids: Vec<&str> = second.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(first_ids, second_ids);
    // push first, then pulls in sorted node order
    assert_eq!(first[0].name, "A");
    assert!(matches!(first[0].kind, TaskKind::Push { .. }));
    assert_eq!(first[1].name, "A");
    assert_eq!(first[2].name, "B");
}

#[test]
fn sends_to_unknown_nodes_are_dropped() {
    let mut checkpoint = Checkpoint::empty();
    checkpoint.pending_sends = vec![
        SendPacket::new("ghost", json!(0)),
        SendPacket::new("A", json!(1)),
    ];
    let nodes = two_nodes();
    let channels = channels_for(&[("in", ChannelSpec::LastValue)]);
    let tasks = prepare_tasks(&checkpoint, &channels, &nodes, 0, "", &[]);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "A");
}

#[test]
fn nodes_trigger_only_on_unseen_versions() {
    let mut checkpoint = Checkpoint::empty();
    checkpoint
        .channel_versions
        .insert("in".to_string(), ChannelVersion::Int(2));
    checkpoint.versions_seen.insert("A".to_string(), {
        let mut seen = FxHashMap::default();
        seen.insert("in".to_string(), ChannelVersion::Int(2));
        seen
    });
    let nodes = two_nodes();
    let mut channels = channels_for(&[("in", ChannelSpec::LastValue)]);
    channels
        .get_mut("in")
        .unwrap()
        .update(vec![json!("v")])
        .unwrap();

    let tasks = prepare_tasks(&checkpoint, &channels, &nodes, 1, "", &[]);
    // A already observed version 2; only B is eligible.
    let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["B"]);
}

#[test]
fn triggered_node_with_unreadable_input_is_skipped() {
    let mut checkpoint = Checkpoint::empty();
    checkpoint
        .channel_versions
        .insert("in".to_string(), ChannelVersion::Int(1));
    let nodes = two_nodes();
    // Channel exists but holds no value.
    let channels = channels_for(&[("in", ChannelSpec::LastValue)]);
    let tasks = prepare_tasks(&checkpoint, &channels, &nodes, 0, "", &[]);
    assert!(tasks.is_empty());
}

#[test]
fn map_channels_build_object_input_with_optional_keys() {
    let mut checkpoint = Checkpoint::empty();
    checkpoint
        .channel_versions
        .insert("a".to_string(), ChannelVersion::Int(1));
    let mut nodes = FxHashMap::default();
    nodes.insert(
        "n".to_string(),
        PregelNode::new("n", fixed_writes([("a", json!(1))]))
            .with_triggers(["a"])
            .with_channel_map([("left", "a"), ("right", "b")]),
    );
    let mut channels = channels_for(&[("a", ChannelSpec::LastValue), ("b", ChannelSpec::LastValue)]);
    channels
        .get_mut("a")
        .unwrap()
        .update(vec![json!(10)])
        .unwrap();

    let tasks = prepare_tasks(&checkpoint, &channels, &nodes, 0, "", &[]);
    assert_eq!(tasks.len(), 1);
    // "b" is optional (not a trigger) and empty, so it is omitted.
    assert_eq!(tasks[0].input, json!({"left": 10}));
}

#[test]
fn recorded_resume_and_writes_bind_by_task_id() {
    let mut checkpoint = Checkpoint::empty();
    checkpoint.pending_sends = vec![SendPacket::new("A", json!(1))];
    let nodes = two_nodes();
    let channels = channels_for(&[("in", ChannelSpec::LastValue)]);
    let probe = prepare_tasks(&checkpoint, &channels, &nodes, 0, "", &[]);
    let task_id = probe[0].id.clone();

    let pending = vec![
        PendingWrite {
            task_id: task_id.clone(),
            channel: RESUME.to_string(),
            value: json!("Ada"),
            idx: -1,
        },
        PendingWrite {
            task_id: "someone-else".to_string(),
            channel: "out".to_string(),
            value: json!(9),
            idx: 0,
        },
    ];
    let tasks = prepare_tasks(&checkpoint, &channels, &nodes, 0, "", &pending);
    assert_eq!(tasks[0].resume, Some(json!("Ada")));
    assert!(tasks[0].replayed_writes.is_none());
}

#[test]
fn namespaces_nest_with_separator() {
    assert_eq!(task_namespace("", "A"), "A");
    assert_eq!(task_namespace("outer:task", "A"), "outer:task:A");
    let id_root = deterministic_task_id("not-a-uuid", "A", 0, "A", PUSH, &Value::from(0));
    let id_nested = deterministic_task_id("not-a-uuid", "p:A", 0, "A", PUSH, &Value::from(0));
    assert_ne!(id_root, id_nested);
}
