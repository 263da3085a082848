//! Node descriptions and the execution seam.
//!
//! A [`PregelNode`] is the *static* description of an actor: which channels
//! trigger it, which channels it reads, the bound computation, and optional
//! retry/cache policies. The bound computation implements [`NodeRunner`]
//! and receives a [`NodeContext`] — the task-scoped configuration carrying
//! the deterministic task id, the resume slot, the event writer, and the
//! cancellation signal.
//!
//! # Interrupts
//!
//! Human-in-the-loop pauses are expressed with [`NodeContext::interrupt`]:
//!
//! ```rust,no_run
//! # use stategraph::node::{NodeContext, NodeError, NodeUpdate};
//! # use serde_json::json;
//! # fn example(ctx: &NodeContext) -> Result<NodeUpdate, NodeError> {
//! let name = ctx.interrupt(json!("What is your name?"))?;
//! Ok(NodeUpdate::writes([("greeting", json!(format!("Hello {name}")))]))
//! # }
//! ```
//!
//! On first execution the call fails with the structured interrupt signal,
//! which the loop persists and surfaces to the caller; once the run is
//! resumed with a `Command { resume }`, the same call returns the resume
//! value synchronously and the rest of the node runs exactly once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::event_bus::{EventEmitter, StreamEvent};
use crate::pregel::{CachePolicy, RetryPolicy};
use crate::types::{ChannelWrite, Command, Interrupt, StreamMode};

/// Maps the resolved channel input to the value handed to the node.
pub type InputMapper = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// How a node's input is read from the channel set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeChannels {
    /// Read the first readable channel, in order. If none are readable the
    /// node is skipped this step.
    List(Vec<String>),
    /// Build an object input: each key reads from its mapped channel.
    /// A key is required (skipping the node when unreadable) iff its
    /// channel is one of the node's triggers; other keys are optional.
    Map(Vec<(String, String)>),
}

impl Default for NodeChannels {
    fn default() -> Self {
        NodeChannels::List(Vec::new())
    }
}

/// Static description of a node in the graph.
///
/// Nodes are pure data; the loop decides each superstep whether a node is
/// eligible by comparing its `triggers` against the checkpoint's version
/// vectors, then resolves its input per `channels` and dispatches `bound`.
#[derive(Clone)]
pub struct PregelNode {
    pub name: String,
    /// Channels whose version bump makes this node eligible.
    pub triggers: Vec<String>,
    /// Channels this node reads its input from.
    pub channels: NodeChannels,
    /// The bound computation.
    pub bound: Arc<dyn NodeRunner>,
    /// Declared output channels. Empty means unrestricted; otherwise a
    /// write outside this set fails the task.
    pub writers: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    pub tags: Vec<String>,
    pub metadata: FxHashMap<String, Value>,
    /// Post-processes the resolved input before it reaches `bound`.
    pub mapper: Option<InputMapper>,
}

impl PregelNode {
    pub fn new(name: impl Into<String>, bound: Arc<dyn NodeRunner>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            channels: NodeChannels::default(),
            bound,
            writers: Vec::new(),
            retry_policy: None,
            cache_policy: None,
            tags: Vec::new(),
            metadata: FxHashMap::default(),
            mapper: None,
        }
    }

    #[must_use]
    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    /// Read input from the first readable channel of `channels`.
    #[must_use]
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = NodeChannels::List(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Read input as an object of `key → channel value` entries.
    #[must_use]
    pub fn with_channel_map<I, K, C>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, C)>,
        K: Into<String>,
        C: Into<String>,
    {
        self.channels = NodeChannels::Map(
            entries
                .into_iter()
                .map(|(k, c)| (k.into(), c.into()))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn with_writers<I, S>(mut self, writers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writers = writers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: FxHashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_mapper(mut self, mapper: InputMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }
}

impl fmt::Debug for PregelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PregelNode")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("channels", &self.channels)
            .field("writers", &self.writers)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// The executable seam: a unit of computation dispatched by the loop.
///
/// Implementations must resolve to a concrete [`NodeUpdate`]; lazily
/// evaluated sequences are not a supported node form.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeUpdate, NodeError>;
}

/// The update a node hands back to the loop.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeUpdate {
    /// Plain channel writes, applied at the superstep barrier.
    Writes(Vec<ChannelWrite>),
    /// A control-flow command: writes plus dynamic dispatch.
    Command(Command),
}

impl NodeUpdate {
    /// No writes.
    #[must_use]
    pub fn empty() -> Self {
        NodeUpdate::Writes(Vec::new())
    }

    /// Writes from `(channel, value)` pairs.
    pub fn writes<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        NodeUpdate::Writes(
            entries
                .into_iter()
                .map(|(channel, value)| ChannelWrite::new(channel, value))
                .collect(),
        )
    }

    /// A single write.
    pub fn write(channel: impl Into<String>, value: Value) -> Self {
        NodeUpdate::Writes(vec![ChannelWrite::new(channel, value)])
    }
}

impl From<Vec<ChannelWrite>> for NodeUpdate {
    fn from(writes: Vec<ChannelWrite>) -> Self {
        NodeUpdate::Writes(writes)
    }
}

impl From<Command> for NodeUpdate {
    fn from(command: Command) -> Self {
        NodeUpdate::Command(command)
    }
}

/// Read access to the channel values a task starts from.
///
/// Values are the step-start snapshot: a node never observes its own
/// in-flight writes, which are returned in one batch and applied at the
/// barrier.
#[derive(Clone, Debug, Default)]
pub struct ChannelReader {
    values: Arc<FxHashMap<String, Value>>,
}

impl ChannelReader {
    pub(crate) fn new(values: Arc<FxHashMap<String, Value>>) -> Self {
        Self { values }
    }

    /// Value of `channel` at the start of this step, if readable.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<&Value> {
        self.values.get(channel)
    }

    /// All readable channel values at the start of this step.
    #[must_use]
    pub fn values(&self) -> &FxHashMap<String, Value> {
        &self.values
    }
}

/// Writer handed to tasks for emitting stream chunks while they run.
///
/// Events always fan out to the observability bus (best-effort) and, when
/// the corresponding stream mode is selected, onto the run stream — where
/// delivery is awaited, giving the consumer backpressure over the run.
#[derive(Clone)]
pub struct TaskWriter {
    pub(crate) namespace: Option<String>,
    pub(crate) node: String,
    pub(crate) bus: Arc<dyn EventEmitter>,
    pub(crate) stream: Option<flume::Sender<StreamEvent>>,
    pub(crate) modes: Arc<Vec<StreamMode>>,
}

impl TaskWriter {
    /// Emit a user chunk on the `custom` stream.
    pub async fn custom(&self, value: Value) {
        let event = StreamEvent::Custom {
            namespace: self.namespace.clone(),
            node: self.node.clone(),
            value,
        };
        self.dispatch(event, StreamMode::Custom).await;
    }

    /// Emit a message chunk on the `messages` stream.
    pub async fn message(&self, chunk: Value) {
        let event = StreamEvent::Messages {
            namespace: self.namespace.clone(),
            node: self.node.clone(),
            chunk,
        };
        self.dispatch(event, StreamMode::Messages).await;
    }

    async fn dispatch(&self, event: StreamEvent, mode: StreamMode) {
        if self.bus.emit(event.clone()).is_err() {
            tracing::debug!(node = %self.node, "event bus closed; dropping task event");
        }
        if self.modes.contains(&mode) {
            if let Some(tx) = &self.stream {
                if tx.send_async(event).await.is_err() {
                    tracing::debug!(node = %self.node, "run stream dropped; task event lost");
                }
            }
        }
    }
}

impl fmt::Debug for TaskWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWriter")
            .field("node", &self.node)
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Task-scoped configuration passed to every node invocation.
#[derive(Clone, Debug)]
pub struct NodeContext {
    /// Deterministic id of this task.
    pub task_id: String,
    /// Name of the node being executed.
    pub node: String,
    /// Superstep number.
    pub step: i64,
    /// Namespace for subgraph checkpoints launched from this task
    /// (`parent_ns:task_id`).
    pub namespace: String,
    pub(crate) resume: Option<Value>,
    pub(crate) writer: TaskWriter,
    pub(crate) reader: ChannelReader,
    pub(crate) cancel: Option<watch::Receiver<bool>>,
}

impl NodeContext {
    /// Pause the graph with `value`, or return the pending resume value.
    ///
    /// The error carries a structured [`Interrupt`] keyed by this task's
    /// id; propagate it with `?` so the loop can persist the pause.
    pub fn interrupt(&self, value: Value) -> Result<Value, NodeError> {
        match &self.resume {
            Some(resume) => Ok(resume.clone()),
            None => Err(NodeError::Interrupt(Interrupt::during(
                self.task_id.clone(),
                value,
            ))),
        }
    }

    /// The resume value for this task, when one is pending.
    #[must_use]
    pub fn resume_value(&self) -> Option<&Value> {
        self.resume.as_ref()
    }

    /// Step-start channel values.
    #[must_use]
    pub fn reader(&self) -> &ChannelReader {
        &self.reader
    }

    /// Stream writer for this task.
    #[must_use]
    pub fn writer(&self) -> &TaskWriter {
        &self.writer
    }

    /// `true` once the run's cancellation signal fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fail fast when the run was cancelled.
    pub fn ensure_active(&self) -> Result<(), NodeError> {
        if self.is_cancelled() {
            Err(NodeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Errors produced by node execution.
///
/// `Interrupt` and `Cancelled` are control-flow signals consumed by the
/// loop; the remaining variants are genuine failures that propagate out of
/// the invocation once retries are exhausted.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Structured pause raised via [`NodeContext::interrupt`].
    #[error("graph interrupted: {}", .0.id)]
    #[diagnostic(
        code(stategraph::node::interrupt),
        help("Resume the thread with Command::resume(value) to continue.")
    )]
    Interrupt(Interrupt),

    /// The run's cancellation signal fired.
    #[error("task cancelled")]
    #[diagnostic(code(stategraph::node::cancelled))]
    Cancelled,

    /// Expected input data was missing.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(stategraph::node::missing_input),
        help("Check that an upstream node produced the required data: {what}.")
    )]
    MissingInput { what: String },

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(code(stategraph::node::validation))]
    Validation(String),

    /// External provider or service error.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(stategraph::node::provider))]
    Provider { provider: String, message: String },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(stategraph::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Anything else.
    #[error("{0}")]
    #[diagnostic(code(stategraph::node::other))]
    Other(String),
}

impl NodeError {
    /// Stable kind name matched by retry policies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Interrupt(_) => "interrupt",
            NodeError::Cancelled => "cancelled",
            NodeError::MissingInput { .. } => "missing_input",
            NodeError::Validation(_) => "validation",
            NodeError::Provider { .. } => "provider",
            NodeError::Serde(_) => "serde",
            NodeError::Other(_) => "other",
        }
    }

    /// Control-flow signals are never retried and never counted as task
    /// failures.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(self, NodeError::Interrupt(_) | NodeError::Cancelled)
    }
}
