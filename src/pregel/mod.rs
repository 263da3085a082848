//! The execution engine and its public surface.
//!
//! A [`Pregel`] owns the static graph description (nodes + channel specs)
//! and exposes the invocation surface:
//!
//! - [`Pregel::invoke`] — run to completion or first pause.
//! - [`Pregel::stream`] — run while yielding [`StreamEvent`]s with
//!   consumer backpressure.
//! - [`Pregel::get_state`] / [`Pregel::get_state_history`] — read
//!   checkpoints as state snapshots.
//! - [`Pregel::update_state`] — commit a synthetic checkpoint from an
//!   external update (forking when pointed at an older checkpoint).
//!
//! Execution proceeds in supersteps until no node is eligible; every
//! superstep commits a checkpoint, so a run can be paused, resumed,
//! rewound, or forked at any step boundary.

pub mod apply;
pub mod cache;
pub mod prepare;
pub mod retry;
mod run;

pub use apply::{
    ApplyOutcome, ExecutedTask, IdleNotify, VersionFn, apply_writes, default_next_version,
};
pub use cache::{CacheKeyFn, CachePolicy, CacheStore, InMemoryCache};
pub use prepare::{PregelTask, TaskKind, deterministic_task_id, prepare_tasks, task_namespace};
pub use retry::{RetryOn, RetryPolicy};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::channels::{Channel, ChannelError, ChannelSpec};
use crate::checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointSaver, CheckpointSource,
    CheckpointTuple, ListOptions, SaverError, new_checkpoint_id,
};
use crate::config::RunConfig;
use crate::event_bus::{EventBus, EventSink, StreamEvent};
use crate::node::{NodeError, PregelNode};
use crate::types::{ChannelWrite, Command, Interrupt, is_reserved_channel};
use run::PregelLoop;

/// Errors surfaced by graph construction and execution.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    /// The run exceeded its configured maximum number of supersteps.
    #[error("recursion limit of {limit} supersteps exceeded")]
    #[diagnostic(
        code(stategraph::graph::recursion),
        help("Raise RunConfig::recursion_limit, or check the graph for an unbounded cycle.")
    )]
    Recursion { limit: usize },

    /// The graph description is inconsistent.
    #[error("invalid graph: {0}")]
    #[diagnostic(code(stategraph::graph::invalid))]
    InvalidGraph(String),

    /// The invocation input is inconsistent with the graph.
    #[error("invalid input: {0}")]
    #[diagnostic(code(stategraph::graph::invalid_input))]
    InvalidInput(String),

    /// A state operation needs a checkpoint saver but none is attached.
    #[error("no checkpoint saver attached")]
    #[diagnostic(
        code(stategraph::graph::no_saver),
        help("Attach a saver with PregelBuilder::with_saver to use state APIs.")
    )]
    NoSaver,

    /// A node failed after exhausting its retries.
    #[error("node '{node}' failed: {source}")]
    #[diagnostic(code(stategraph::graph::node))]
    Node {
        node: String,
        #[source]
        source: NodeError,
    },

    /// A channel rejected an update.
    #[error(transparent)]
    #[diagnostic(code(stategraph::graph::channel))]
    Channel(#[from] ChannelError),

    /// The checkpoint saver failed.
    #[error(transparent)]
    #[diagnostic(code(stategraph::graph::saver))]
    Saver(#[from] SaverError),

    /// Internal serialization failure.
    #[error("serialization failed: {0}")]
    #[diagnostic(code(stategraph::graph::serde))]
    Serde(#[from] serde_json::Error),

    /// The run was aborted by its cancellation signal. Writes persisted
    /// before the abort remain visible for resume.
    #[error("run cancelled")]
    #[diagnostic(code(stategraph::graph::cancelled))]
    Cancelled,

    /// A task worker panicked or was torn down.
    #[error("task join error: {0}")]
    #[diagnostic(code(stategraph::graph::join))]
    Join(#[from] tokio::task::JoinError),
}

/// Input to one invocation.
#[derive(Clone, Debug, Default)]
pub enum GraphInput {
    /// Resume from saved state without new input.
    #[default]
    Null,
    /// Channel writes applied as a `source: "input"` checkpoint.
    Values(FxHashMap<String, Value>),
    /// Control command (resume / update / goto).
    Command(Command),
    /// Shorthand for `Command::resume(value)`.
    Resume(Value),
}

impl GraphInput {
    /// Input writes from `(channel, value)` pairs.
    pub fn values<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        GraphInput::Values(
            entries
                .into_iter()
                .map(|(channel, value)| (channel.into(), value))
                .collect(),
        )
    }
}

impl From<Command> for GraphInput {
    fn from(command: Command) -> Self {
        GraphInput::Command(command)
    }
}

/// What an invocation returns: the projected output values, plus any
/// interrupts when the run paused instead of completing.
#[derive(Clone, Debug)]
pub struct RunOutput {
    pub values: FxHashMap<String, Value>,
    pub interrupts: Vec<Interrupt>,
}

impl RunOutput {
    /// `true` when the run paused on an interrupt rather than finishing.
    /// Resuming the same thread with a `Command::resume` continues it.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        !self.interrupts.is_empty()
    }
}

/// Handle to a streaming run: an event receiver plus the join handle
/// resolving to the final [`RunOutput`].
///
/// The event channel is bounded; the loop awaits delivery of each event
/// before advancing, so a slow consumer backpressures the run. Dropping
/// the receiver (or calling [`RunStream::join`]) releases the loop to run
/// unobserved.
#[derive(Debug)]
pub struct RunStream {
    events: flume::Receiver<StreamEvent>,
    handle: tokio::task::JoinHandle<Result<RunOutput, GraphError>>,
}

impl RunStream {
    /// Next event, or `None` once the run finished.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv_async().await.ok()
    }

    /// Stop consuming events and wait for the run's result.
    pub async fn join(self) -> Result<RunOutput, GraphError> {
        drop(self.events);
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(GraphError::Join(err)),
        }
    }

    /// Drain all events, then return them with the run's result.
    pub async fn collect(mut self) -> (Vec<StreamEvent>, Result<RunOutput, GraphError>) {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        let result = self.join().await;
        (events, result)
    }
}

/// Options for [`Pregel::get_state_history`].
#[derive(Clone, Debug, Default)]
pub struct HistoryOptions {
    pub limit: Option<usize>,
    /// Only snapshots created strictly before this checkpoint id.
    pub before: Option<String>,
}

/// A checkpoint read back as a state snapshot.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    /// Readable channel values at this checkpoint.
    pub values: FxHashMap<String, Value>,
    /// Names of the tasks that would run next from this checkpoint.
    pub next: Vec<String>,
    /// Address of this checkpoint.
    pub config: CheckpointRef,
    pub parent_id: Option<String>,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

/// A compiled graph: nodes, channel specs, policies, and the attached
/// persistence/observability collaborators.
///
/// `Pregel` is cheaply cloneable (all heavy state sits behind `Arc`s);
/// each invocation gets its own loop over a private channel set hydrated
/// from the thread's checkpoint.
#[derive(Clone)]
pub struct Pregel {
    pub(crate) nodes: FxHashMap<String, PregelNode>,
    pub(crate) channel_specs: FxHashMap<String, ChannelSpec>,
    pub(crate) output_channels: Option<Vec<String>>,
    pub(crate) interrupt_before: Vec<String>,
    pub(crate) interrupt_after: Vec<String>,
    pub(crate) saver: Option<Arc<dyn CheckpointSaver>>,
    pub(crate) cache: Option<Arc<dyn CacheStore>>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) version_fn: VersionFn,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) stream_buffer: usize,
}

impl Pregel {
    #[must_use]
    pub fn builder() -> PregelBuilder {
        PregelBuilder::default()
    }

    /// Run to completion or first pause; returns the final (or paused)
    /// output values.
    #[instrument(skip(self, input, config), err)]
    pub async fn invoke(
        &self,
        input: GraphInput,
        config: RunConfig,
    ) -> Result<RunOutput, GraphError> {
        PregelLoop::run(self.clone(), input, config, None).await
    }

    /// Run while streaming events. Must be called within a tokio runtime;
    /// the loop executes on a spawned task.
    #[must_use]
    pub fn stream(&self, input: GraphInput, config: RunConfig) -> RunStream {
        let (tx, rx) = flume::bounded(self.stream_buffer);
        let graph = self.clone();
        let handle = tokio::spawn(async move { PregelLoop::run(graph, input, config, Some(tx)).await });
        RunStream {
            events: rx,
            handle,
        }
    }

    /// The observability bus shared by every run of this graph.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Latest (or pinned) checkpoint of the configured thread, as a state
    /// snapshot.
    #[instrument(skip(self, config), err)]
    pub async fn get_state(&self, config: &RunConfig) -> Result<Option<StateSnapshot>, GraphError> {
        let saver = self.saver.as_ref().ok_or(GraphError::NoSaver)?;
        let at = CheckpointRef::from_config(config)?;
        let Some(tuple) = saver.get_tuple(&at).await? else {
            return Ok(None);
        };
        Ok(Some(self.snapshot_from_tuple(&tuple, &config.checkpoint_ns)?))
    }

    /// The thread's checkpoints as snapshots, newest first.
    #[instrument(skip(self, config, options), err)]
    pub async fn get_state_history(
        &self,
        config: &RunConfig,
        options: HistoryOptions,
    ) -> Result<Vec<StateSnapshot>, GraphError> {
        let saver = self.saver.as_ref().ok_or(GraphError::NoSaver)?;
        let at = CheckpointRef::from_config(config)?.latest();
        let list_options = ListOptions {
            before: options.before,
            limit: options.limit,
            filter: FxHashMap::default(),
        };
        let mut stream = saver.list(&at, list_options).await?;
        let mut snapshots = Vec::new();
        while let Some(tuple) = stream.next().await {
            snapshots.push(self.snapshot_from_tuple(&tuple?, &config.checkpoint_ns)?);
        }
        Ok(snapshots)
    }

    /// Apply external writes as a synthetic checkpoint attributed to
    /// `as_node` (`source: "update"`). Pointing the config at an older
    /// checkpoint forks the thread. Returns the config pinned at the new
    /// checkpoint.
    #[instrument(skip(self, config, writes), err)]
    pub async fn update_state(
        &self,
        config: &RunConfig,
        writes: Vec<ChannelWrite>,
        as_node: Option<&str>,
    ) -> Result<RunConfig, GraphError> {
        let saver = self.saver.as_ref().ok_or(GraphError::NoSaver)?;
        let at = CheckpointRef::from_config(config)?;
        let tuple = saver.get_tuple(&at).await?;
        let (mut checkpoint, step, base) = match &tuple {
            Some(tuple) => (
                tuple.checkpoint.clone(),
                tuple.metadata.step + 1,
                tuple.checkpoint_ref(),
            ),
            None => (Checkpoint::empty(), -1, at.latest()),
        };

        let node_name = match as_node {
            Some(name) => {
                if !self.nodes.contains_key(name) {
                    return Err(GraphError::InvalidInput(format!(
                        "as_node targets unknown node '{name}'"
                    )));
                }
                name.to_string()
            }
            None => {
                if self.nodes.len() == 1 {
                    self.nodes.keys().next().cloned().unwrap_or_default()
                } else {
                    return Err(GraphError::InvalidInput(
                        "as_node is required when the graph has more than one node".to_string(),
                    ));
                }
            }
        };
        let triggers = self
            .nodes
            .get(&node_name)
            .map(|node| node.triggers.clone())
            .unwrap_or_default();

        let mut channels = self.build_channels(&checkpoint)?;
        // The synthetic step must not consume the pending sends the real
        // next step is owed, and its idle notification is scoped to the
        // node's own triggers so per-step state on unrelated channels
        // survives.
        let saved_sends = checkpoint.pending_sends.clone();
        let summary = serde_json::to_value(&writes)?;
        let executed = ExecutedTask {
            name: node_name.clone(),
            triggers,
            writes,
        };
        apply_writes(
            &mut checkpoint,
            &mut channels,
            &[executed],
            &self.nodes,
            &self.version_fn,
            IdleNotify::TriggersOnly,
        )?;
        checkpoint.pending_sends = saved_sends;

        checkpoint.id = new_checkpoint_id();
        checkpoint.ts = Utc::now();
        let mut metadata = CheckpointMetadata::new(CheckpointSource::Update, step);
        metadata.writes.insert(node_name, summary);
        let next = saver.put(&base, checkpoint, metadata).await?;

        let mut next_config = config.clone();
        next_config.checkpoint_id = next.checkpoint_id;
        Ok(next_config)
    }

    pub(crate) fn build_channels(
        &self,
        checkpoint: &Checkpoint,
    ) -> Result<FxHashMap<String, Box<dyn Channel>>, ChannelError> {
        let mut channels = FxHashMap::default();
        for (name, spec) in &self.channel_specs {
            let snapshot = checkpoint.channel_values.get(name).cloned();
            channels.insert(name.clone(), spec.from_checkpoint(snapshot)?);
        }
        Ok(channels)
    }

    pub(crate) fn read_values(
        &self,
        channels: &FxHashMap<String, Box<dyn Channel>>,
    ) -> FxHashMap<String, Value> {
        let mut values = FxHashMap::default();
        match &self.output_channels {
            Some(projection) => {
                for name in projection {
                    if let Some(channel) = channels.get(name) {
                        if let Ok(value) = channel.get() {
                            values.insert(name.clone(), value);
                        }
                    }
                }
            }
            None => {
                for (name, channel) in channels {
                    if let Ok(value) = channel.get() {
                        values.insert(name.clone(), value);
                    }
                }
            }
        }
        values
    }

    fn snapshot_from_tuple(
        &self,
        tuple: &CheckpointTuple,
        checkpoint_ns: &str,
    ) -> Result<StateSnapshot, GraphError> {
        let channels = self.build_channels(&tuple.checkpoint)?;
        let next = prepare_tasks(
            &tuple.checkpoint,
            &channels,
            &self.nodes,
            tuple.metadata.step + 1,
            checkpoint_ns,
            &tuple.pending_writes,
        )
        .into_iter()
        .map(|task| task.name)
        .collect();
        Ok(StateSnapshot {
            values: self.read_values(&channels),
            next,
            config: tuple.checkpoint_ref(),
            parent_id: tuple.parent_id.clone(),
            metadata: tuple.metadata.clone(),
            created_at: tuple.checkpoint.ts,
        })
    }
}

impl std::fmt::Debug for Pregel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pregel")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("channels", &self.channel_specs.keys().collect::<Vec<_>>())
            .field("interrupt_before", &self.interrupt_before)
            .field("interrupt_after", &self.interrupt_after)
            .finish_non_exhaustive()
    }
}

/// Minimal construction surface for [`Pregel`].
#[derive(Default)]
pub struct PregelBuilder {
    nodes: Vec<PregelNode>,
    channel_specs: FxHashMap<String, ChannelSpec>,
    output_channels: Option<Vec<String>>,
    interrupt_before: Vec<String>,
    interrupt_after: Vec<String>,
    saver: Option<Arc<dyn CheckpointSaver>>,
    cache: Option<Arc<dyn CacheStore>>,
    retry_policy: Option<RetryPolicy>,
    version_fn: Option<VersionFn>,
    sinks: Vec<Box<dyn EventSink>>,
    stream_buffer: Option<usize>,
}

impl PregelBuilder {
    #[must_use]
    pub fn add_node(mut self, node: PregelNode) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn add_channel(mut self, name: impl Into<String>, spec: ChannelSpec) -> Self {
        self.channel_specs.insert(name.into(), spec);
        self
    }

    /// Project the run output to these channels (default: all readable).
    #[must_use]
    pub fn with_output_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_saver(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.saver = Some(saver);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Default retry policy for nodes without their own.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Override the version allocator (e.g. string versions for backends
    /// that order lexicographically).
    #[must_use]
    pub fn with_version_fn(mut self, version_fn: VersionFn) -> Self {
        self.version_fn = Some(version_fn);
        self
    }

    #[must_use]
    pub fn with_event_sink<T: EventSink + 'static>(mut self, sink: T) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Capacity of the bounded run-stream channel (default 64).
    #[must_use]
    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = Some(capacity.max(1));
        self
    }

    pub fn build(self) -> Result<Pregel, GraphError> {
        for name in self.channel_specs.keys() {
            if is_reserved_channel(name) {
                return Err(GraphError::InvalidGraph(format!(
                    "channel name '{name}' is reserved"
                )));
            }
        }

        let mut nodes: FxHashMap<String, PregelNode> = FxHashMap::default();
        for node in self.nodes {
            if node.name.is_empty() || node.name.starts_with("__") {
                return Err(GraphError::InvalidGraph(format!(
                    "invalid node name '{}'",
                    node.name
                )));
            }
            for trigger in &node.triggers {
                if !self.channel_specs.contains_key(trigger) {
                    return Err(GraphError::InvalidGraph(format!(
                        "node '{}' triggers unknown channel '{trigger}'",
                        node.name
                    )));
                }
            }
            let read_channels: Vec<&String> = match &node.channels {
                crate::node::NodeChannels::List(list) => list.iter().collect(),
                crate::node::NodeChannels::Map(entries) => {
                    entries.iter().map(|(_, channel)| channel).collect()
                }
            };
            for channel in read_channels {
                if !self.channel_specs.contains_key(channel) {
                    return Err(GraphError::InvalidGraph(format!(
                        "node '{}' reads unknown channel '{channel}'",
                        node.name
                    )));
                }
            }
            for writer in &node.writers {
                if writer != crate::types::TASKS && !self.channel_specs.contains_key(writer) {
                    return Err(GraphError::InvalidGraph(format!(
                        "node '{}' declares unknown output channel '{writer}'",
                        node.name
                    )));
                }
            }
            let name = node.name.clone();
            if nodes.insert(name.clone(), node).is_some() {
                return Err(GraphError::InvalidGraph(format!(
                    "duplicate node name '{name}'"
                )));
            }
        }

        if let Some(projection) = &self.output_channels {
            for name in projection {
                if !self.channel_specs.contains_key(name) {
                    return Err(GraphError::InvalidGraph(format!(
                        "output channel '{name}' is not declared"
                    )));
                }
            }
        }
        for name in self.interrupt_before.iter().chain(&self.interrupt_after) {
            if !nodes.contains_key(name) {
                return Err(GraphError::InvalidGraph(format!(
                    "interrupt references unknown node '{name}'"
                )));
            }
        }

        let bus = if self.sinks.is_empty() {
            EventBus::default()
        } else {
            EventBus::with_sinks(self.sinks)
        };

        Ok(Pregel {
            nodes,
            channel_specs: self.channel_specs,
            output_channels: self.output_channels,
            interrupt_before: self.interrupt_before,
            interrupt_after: self.interrupt_after,
            saver: self.saver,
            cache: self.cache,
            retry_policy: self.retry_policy,
            version_fn: self
                .version_fn
                .unwrap_or_else(|| Arc::new(default_next_version)),
            bus: Arc::new(bus),
            stream_buffer: self.stream_buffer.unwrap_or(64),
        })
    }
}
