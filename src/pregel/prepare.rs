//! Task preparation: deriving the work for one superstep from a
//! checkpoint.
//!
//! Two task kinds exist. *Push* tasks come from the checkpoint's pending
//! sends — dynamic dispatch requested last step. *Pull* tasks come from
//! trigger gating: a node is eligible iff at least one of its trigger
//! channels has a version greater than the version that node last
//! observed (`versions_seen`), with absent entries treated as the null
//! version.
//!
//! Task ids are deterministic UUIDv5 values derived from the parent
//! checkpoint id and the task's identity, so re-preparing the same
//! checkpoint yields byte-identical ids. Resume correctness depends on
//! this: writes persisted mid-step are matched back to their tasks by id.

use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::channels::Channel;
use crate::checkpoint::{Checkpoint, PendingWrite};
use crate::node::{NodeChannels, PregelNode};
use crate::types::{ChannelWrite, INTERRUPT, NS_SEP, PULL, PUSH, RESUME};

/// How a task came to be scheduled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Dispatched by a [`crate::types::SendPacket`] at this index of the
    /// checkpoint's pending sends.
    Push { index: usize },
    /// Triggered by version bumps on the listed channels (sorted).
    Pull { triggers: Vec<String> },
}

/// One unit of work prepared for a superstep.
#[derive(Clone, Debug)]
pub struct PregelTask {
    /// Deterministic id (stable across re-preparation of the same
    /// checkpoint/step/node).
    pub id: String,
    /// Node to execute.
    pub name: String,
    pub kind: TaskKind,
    /// Resolved input value.
    pub input: Value,
    /// Pending resume value recorded for this task id, if any.
    pub resume: Option<Value>,
    /// Writes already persisted for this task id by a previous attempt at
    /// this step. When present the task is not re-executed; the writes
    /// replay as its result.
    pub replayed_writes: Option<Vec<ChannelWrite>>,
}

impl PregelTask {
    /// Triggers as recorded at the apply barrier. Push tasks carry the
    /// reserved push marker so that running them still counts as a step.
    #[must_use]
    pub fn barrier_triggers(&self) -> Vec<String> {
        match &self.kind {
            TaskKind::Push { .. } => vec![PUSH.to_string()],
            TaskKind::Pull { triggers } => triggers.clone(),
        }
    }
}

/// Namespace under which a node's task ids are computed: the parent
/// namespace joined with the node name (root namespace ⇒ the bare name).
#[must_use]
pub fn task_namespace(parent_ns: &str, node: &str) -> String {
    if parent_ns.is_empty() {
        node.to_string()
    } else {
        format!("{parent_ns}{NS_SEP}{node}")
    }
}

/// Deterministic task id: UUIDv5 of `[task_ns, step, name, kind, key]`
/// (serialized as a JSON array) under the checkpoint-id namespace.
///
/// A checkpoint id that is not a parseable UUID is first hashed into a
/// namespace UUID, so determinism never depends on the id format.
#[must_use]
pub fn deterministic_task_id(
    checkpoint_id: &str,
    task_ns: &str,
    step: i64,
    name: &str,
    kind: &str,
    key: &Value,
) -> String {
    let namespace = Uuid::parse_str(checkpoint_id)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, checkpoint_id.as_bytes()));
    let payload = json!([task_ns, step, name, kind, key]).to_string();
    Uuid::new_v5(&namespace, payload.as_bytes()).to_string()
}

/// Compute the tasks eligible to run against `checkpoint` at `step`.
///
/// Ordering is deterministic: push tasks by pending-send index, then pull
/// tasks by sorted node name. Sends targeting unknown nodes are dropped
/// with a warning.
pub fn prepare_tasks(
    checkpoint: &Checkpoint,
    channels: &FxHashMap<String, Box<dyn Channel>>,
    nodes: &FxHashMap<String, PregelNode>,
    step: i64,
    parent_ns: &str,
    pending_writes: &[PendingWrite],
) -> Vec<PregelTask> {
    let mut tasks = Vec::new();

    for (index, send) in checkpoint.pending_sends.iter().enumerate() {
        let Some(node) = nodes.get(&send.node) else {
            tracing::warn!(
                target: "stategraph::prepare",
                node = %send.node,
                index,
                "dropping send to unknown node"
            );
            continue;
        };
        let ns = task_namespace(parent_ns, &node.name);
        let id = deterministic_task_id(&checkpoint.id, &ns, step, &node.name, PUSH, &json!(index));
        let mut input = send.args.clone();
        if let Some(mapper) = &node.mapper {
            input = mapper(input);
        }
        let (resume, replayed_writes) = recorded_state(&id, pending_writes);
        tasks.push(PregelTask {
            id,
            name: node.name.clone(),
            kind: TaskKind::Push { index },
            input,
            resume,
            replayed_writes,
        });
    }

    let mut names: Vec<&String> = nodes.keys().collect();
    names.sort_unstable();
    for name in names {
        let node = &nodes[name];
        let mut triggers: Vec<String> = node
            .triggers
            .iter()
            .filter(|channel| {
                checkpoint
                    .channel_versions
                    .get(*channel)
                    .is_some_and(|version| *version > checkpoint.seen_version(name, channel))
            })
            .cloned()
            .collect();
        if triggers.is_empty() {
            continue;
        }
        triggers.sort_unstable();

        let Some(mut input) = resolve_node_input(node, channels) else {
            continue;
        };
        if let Some(mapper) = &node.mapper {
            input = mapper(input);
        }

        let ns = task_namespace(parent_ns, name);
        let id =
            deterministic_task_id(&checkpoint.id, &ns, step, name, PULL, &json!(triggers));
        let (resume, replayed_writes) = recorded_state(&id, pending_writes);
        tasks.push(PregelTask {
            id,
            name: name.clone(),
            kind: TaskKind::Pull { triggers },
            input,
            resume,
            replayed_writes,
        });
    }

    tasks
}

/// Resolve a node's input from the current channel values.
///
/// Returns `None` when the node must be skipped this step (no readable
/// channel for a list spec, or a required key unreadable for a map spec).
pub fn resolve_node_input(
    node: &PregelNode,
    channels: &FxHashMap<String, Box<dyn Channel>>,
) -> Option<Value> {
    match &node.channels {
        NodeChannels::List(list) => {
            if list.is_empty() {
                return Some(Value::Null);
            }
            for name in list {
                if let Some(channel) = channels.get(name) {
                    if let Ok(value) = channel.get() {
                        return Some(value);
                    }
                }
            }
            None
        }
        NodeChannels::Map(entries) => {
            let mut object = serde_json::Map::new();
            for (key, channel_name) in entries {
                let value = channels.get(channel_name).and_then(|c| c.get().ok());
                match value {
                    Some(value) => {
                        object.insert(key.clone(), value);
                    }
                    None if node.triggers.contains(channel_name) => return None,
                    None => {}
                }
            }
            Some(Value::Object(object))
        }
    }
}

/// Resume value and replayable writes previously persisted for `task_id`.
fn recorded_state(
    task_id: &str,
    pending_writes: &[PendingWrite],
) -> (Option<Value>, Option<Vec<ChannelWrite>>) {
    let resume = pending_writes
        .iter()
        .find(|w| w.task_id == task_id && w.channel == RESUME && !w.value.is_null())
        .map(|w| w.value.clone());

    let mut rows: Vec<&PendingWrite> = pending_writes
        .iter()
        .filter(|w| w.task_id == task_id && w.channel != RESUME && w.channel != INTERRUPT)
        .collect();
    rows.sort_by_key(|w| w.idx);
    let replayed = if rows.is_empty() {
        None
    } else {
        Some(
            rows.into_iter()
                .map(|w| ChannelWrite::new(w.channel.clone(), w.value.clone()))
                .collect(),
        )
    };
    (resume, replayed)
}
