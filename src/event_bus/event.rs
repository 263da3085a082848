use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::Checkpoint;
use crate::types::{ChannelWrite, StreamMode};

/// One event emitted by a running graph.
///
/// Events carry an optional subgraph `namespace` identifying the nested
/// run that produced them; the root graph emits `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Emitted once per run before the first superstep.
    Metadata { run_id: String, step: i64 },
    /// Post-step snapshot of the (projected) channel values.
    Values {
        namespace: Option<String>,
        step: i64,
        values: FxHashMap<String, Value>,
    },
    /// Writes each node produced in the step.
    Updates {
        namespace: Option<String>,
        step: i64,
        updates: FxHashMap<String, Vec<ChannelWrite>>,
    },
    /// Message chunk emitted by a node while it runs.
    Messages {
        namespace: Option<String>,
        node: String,
        chunk: Value,
    },
    /// User chunk written through the task writer.
    Custom {
        namespace: Option<String>,
        node: String,
        value: Value,
    },
    /// The committed checkpoint plus a preview of the next step's tasks.
    Checkpoints {
        namespace: Option<String>,
        step: i64,
        checkpoint: Checkpoint,
        next: Vec<String>,
    },
    /// Task lifecycle event.
    Tasks(TaskEvent),
    /// Internal diagnostic payload.
    Debug {
        namespace: Option<String>,
        message: String,
    },
    /// Structured error.
    Error { error: String, message: String },
}

impl StreamEvent {
    /// The stream mode that gates this event on the run stream, or `None`
    /// for events that are always delivered (run metadata).
    #[must_use]
    pub fn mode(&self) -> Option<StreamMode> {
        match self {
            StreamEvent::Metadata { .. } => None,
            StreamEvent::Values { .. } => Some(StreamMode::Values),
            StreamEvent::Updates { .. } => Some(StreamMode::Updates),
            StreamEvent::Messages { .. } => Some(StreamMode::Messages),
            StreamEvent::Custom { .. } => Some(StreamMode::Custom),
            StreamEvent::Checkpoints { .. } => Some(StreamMode::Checkpoints),
            StreamEvent::Tasks(_) => Some(StreamMode::Tasks),
            StreamEvent::Debug { .. } => Some(StreamMode::Debug),
            StreamEvent::Error { .. } => Some(StreamMode::Errors),
        }
    }

    /// The subgraph namespace that produced this event, when any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        match self {
            StreamEvent::Metadata { .. } | StreamEvent::Error { .. } => None,
            StreamEvent::Values { namespace, .. }
            | StreamEvent::Updates { namespace, .. }
            | StreamEvent::Messages { namespace, .. }
            | StreamEvent::Custom { namespace, .. }
            | StreamEvent::Checkpoints { namespace, .. }
            | StreamEvent::Debug { namespace, .. } => namespace.as_deref(),
            StreamEvent::Tasks(task) => task.namespace.as_deref(),
        }
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEvent::Metadata { run_id, step } => {
                write!(f, "run {run_id} starting at step {step}")
            }
            StreamEvent::Values { step, values, .. } => {
                write!(f, "[step {step}] values: {} channels", values.len())
            }
            StreamEvent::Updates { step, updates, .. } => {
                write!(f, "[step {step}] updates from {} nodes", updates.len())
            }
            StreamEvent::Messages { node, chunk, .. } => write!(f, "[{node}] {chunk}"),
            StreamEvent::Custom { node, value, .. } => write!(f, "[{node}] custom: {value}"),
            StreamEvent::Checkpoints {
                step, checkpoint, ..
            } => write!(f, "[step {step}] checkpoint {}", checkpoint.id),
            StreamEvent::Tasks(task) => write!(f, "{task}"),
            StreamEvent::Debug { message, .. } => write!(f, "{message}"),
            StreamEvent::Error { error, message } => write!(f, "{error}: {message}"),
        }
    }
}

/// Lifecycle of a single task within a superstep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub namespace: Option<String>,
    pub step: i64,
    pub task_id: String,
    pub node: String,
    pub phase: TaskPhase,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TaskPhase {
    /// The task was scheduled this step.
    Created,
    /// The task finished and its writes were gathered.
    Result {
        /// Writes came from the task cache rather than execution.
        cached: bool,
        /// Writes were replayed from persisted pending writes (resume).
        replayed: bool,
    },
    /// The task raised an interrupt and paused the run.
    Interrupted,
    /// The task failed after exhausting its retries.
    Error { message: String },
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match &self.phase {
            TaskPhase::Created => "created".to_string(),
            TaskPhase::Result { cached, replayed } => match (cached, replayed) {
                (true, _) => "done (cached)".to_string(),
                (_, true) => "done (replayed)".to_string(),
                _ => "done".to_string(),
            },
            TaskPhase::Interrupted => "interrupted".to_string(),
            TaskPhase::Error { message } => format!("error: {message}"),
        };
        write!(f, "[step {}] task {}@{}: {phase}", self.step, self.node, self.task_id)
    }
}
