//! The superstep state machine driving one run.
//!
//! Per run: load (or create) the checkpoint, then repeat
//! prepare → execute → apply → checkpoint → emit until no task is
//! eligible, an interrupt pauses the run, the recursion limit trips, or
//! the cancellation signal fires.
//!
//! Durability within a step: every task's writes are persisted through
//! `put_writes` the moment the task completes, keyed by its deterministic
//! id. A crash (or cancellation) mid-step therefore loses nothing — on the
//! next invocation the surviving writes replay by id and only unfinished
//! tasks execute.

use std::sync::Arc;

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::channels::Channel;
use crate::checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointSource, PendingWrite,
    new_checkpoint_id,
};
use crate::config::RunConfig;
use crate::event_bus::{EventEmitter, StreamEvent, TaskEvent, TaskPhase};
use crate::node::{ChannelReader, NodeContext, NodeError, NodeUpdate, PregelNode, TaskWriter};
use crate::pregel::apply::{ExecutedTask, IdleNotify, apply_writes};
use crate::pregel::cache::CacheStore;
use crate::pregel::prepare::{PregelTask, prepare_tasks};
use crate::pregel::retry::RetryPolicy;
use crate::pregel::{GraphError, GraphInput, Pregel, RunOutput};
use crate::types::{
    ChannelWrite, Command, INTERRUPT, Interrupt, NS_SEP, RESUME, StreamMode, TASKS,
};

pub(crate) struct PregelLoop {
    graph: Pregel,
    config: RunConfig,
    stream_tx: Option<flume::Sender<StreamEvent>>,
    modes: Arc<Vec<StreamMode>>,
    bus: Arc<dyn EventEmitter>,
    at: Option<CheckpointRef>,
    checkpoint: Checkpoint,
    channels: FxHashMap<String, Box<dyn Channel>>,
    pending_writes: Vec<PendingWrite>,
    step: i64,
    interrupts: Vec<Interrupt>,
}

enum StepExecution {
    Completed(Vec<Vec<ChannelWrite>>),
    Paused,
}

struct TaskOutcome {
    writes: Vec<ChannelWrite>,
    cached: bool,
}

impl PregelLoop {
    #[tracing::instrument(skip_all, fields(thread = ?config.thread_id))]
    pub(crate) async fn run(
        graph: Pregel,
        input: GraphInput,
        config: RunConfig,
        stream_tx: Option<flume::Sender<StreamEvent>>,
    ) -> Result<RunOutput, GraphError> {
        graph.bus.start();
        let bus = graph.bus.emitter();
        let modes = Arc::new(config.stream_modes.clone());

        let mut at = match &graph.saver {
            Some(_) => Some(CheckpointRef::from_config(&config)?),
            None => None,
        };
        let loaded = match (&graph.saver, &at) {
            (Some(saver), Some(at_ref)) => saver.get_tuple(at_ref).await?,
            _ => None,
        };
        let (checkpoint, pending_writes, step) = match &loaded {
            Some(tuple) => (
                tuple.checkpoint.clone(),
                tuple.pending_writes.clone(),
                tuple.metadata.step + 1,
            ),
            None => (Checkpoint::empty(), Vec::new(), -1),
        };
        if let Some(tuple) = &loaded {
            at = Some(tuple.checkpoint_ref());
        }
        let channels = graph.build_channels(&checkpoint)?;

        let mut this = Self {
            graph,
            config,
            stream_tx,
            modes,
            bus,
            at,
            checkpoint,
            channels,
            pending_writes,
            step,
            interrupts: Vec::new(),
        };
        this.apply_run_input(input).await?;
        this.drive().await
    }

    /// Fold the run input into the thread state before the first superstep.
    async fn apply_run_input(&mut self, input: GraphInput) -> Result<(), GraphError> {
        match input {
            GraphInput::Null => Ok(()),
            GraphInput::Values(values) => {
                let writes: Vec<ChannelWrite> = values
                    .into_iter()
                    .map(|(channel, value)| ChannelWrite::new(channel, value))
                    .collect();
                self.commit_external_writes(CheckpointSource::Input, writes)
                    .await
            }
            GraphInput::Resume(value) => {
                self.record_resume(&value).await?;
                Ok(())
            }
            GraphInput::Command(command) => {
                let Command {
                    resume,
                    update,
                    goto,
                } = command;
                if let Some(value) = resume {
                    self.record_resume(&value).await?;
                }
                if !update.is_empty() || !goto.is_empty() {
                    let mut writes = update;
                    for send in goto {
                        writes.push(ChannelWrite::new(TASKS, serde_json::to_value(&send)?));
                    }
                    self.commit_external_writes(CheckpointSource::Input, writes)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Apply externally supplied writes as a synthetic `__input__` task
    /// and commit the resulting checkpoint.
    async fn commit_external_writes(
        &mut self,
        source: CheckpointSource,
        writes: Vec<ChannelWrite>,
    ) -> Result<(), GraphError> {
        let summary = serde_json::to_value(&writes)?;
        let executed = ExecutedTask {
            name: "__input__".to_string(),
            triggers: Vec::new(),
            writes,
        };
        apply_writes(
            &mut self.checkpoint,
            &mut self.channels,
            &[executed],
            &self.graph.nodes,
            &self.graph.version_fn,
            IdleNotify::TriggersOnly,
        )?;
        let mut metadata = CheckpointMetadata::new(source, self.step);
        metadata.writes.insert("__input__".to_string(), summary);
        self.commit(metadata).await?;
        self.pending_writes.clear();
        self.step += 1;
        Ok(())
    }

    /// Replace the persisted resume placeholders with the actual value so
    /// the interrupted tasks observe it on re-preparation.
    async fn record_resume(&mut self, value: &Value) -> Result<(), GraphError> {
        let mut task_ids: Vec<String> = self
            .pending_writes
            .iter()
            .filter(|w| w.channel == RESUME)
            .map(|w| w.task_id.clone())
            .collect();
        task_ids.sort_unstable();
        task_ids.dedup();
        if task_ids.is_empty() {
            tracing::debug!(
                target: "stategraph::run",
                "resume command received but no interrupted task is pending"
            );
            return Ok(());
        }
        for task_id in &task_ids {
            if let (Some(saver), Some(at)) = (&self.graph.saver, &self.at) {
                saver
                    .put_writes(at, vec![ChannelWrite::new(RESUME, value.clone())], task_id)
                    .await?;
            }
        }
        for write in &mut self.pending_writes {
            if write.channel == RESUME {
                write.value = value.clone();
            }
        }
        Ok(())
    }

    /// Main superstep loop.
    async fn drive(&mut self) -> Result<RunOutput, GraphError> {
        self.emit(StreamEvent::Metadata {
            run_id: Uuid::new_v4().to_string(),
            step: self.step,
        })
        .await;

        let mut steps_executed: usize = 0;
        loop {
            if self.config.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let tasks = prepare_tasks(
                &self.checkpoint,
                &self.channels,
                &self.graph.nodes,
                self.step,
                &self.config.checkpoint_ns,
                &self.pending_writes,
            );
            if tasks.is_empty() {
                break;
            }
            if steps_executed >= self.config.recursion_limit {
                return Err(GraphError::Recursion {
                    limit: self.config.recursion_limit,
                });
            }

            // A breakpoint fires once per task id: the persisted marker
            // lets a resumed run sail past it and execute the node.
            let before_hits: Vec<(String, Interrupt)> = tasks
                .iter()
                .filter(|task| {
                    self.graph.interrupt_before.contains(&task.name)
                        && !self
                            .pending_writes
                            .iter()
                            .any(|w| w.task_id == task.id && w.channel == INTERRUPT)
                })
                .map(|task| {
                    (
                        task.id.clone(),
                        Interrupt::breakpoint(task.id.clone(), json!({"node": task.name})),
                    )
                })
                .collect();
            if !before_hits.is_empty() {
                for (task_id, interrupt) in before_hits {
                    let marker = serde_json::to_value(&interrupt)?;
                    if let (Some(saver), Some(at)) = (&self.graph.saver, &self.at) {
                        saver
                            .put_writes(at, vec![ChannelWrite::new(INTERRUPT, marker.clone())], &task_id)
                            .await?;
                    }
                    self.pending_writes.push(PendingWrite {
                        task_id,
                        channel: INTERRUPT.to_string(),
                        value: marker,
                        idx: -2,
                    });
                    self.interrupts.push(interrupt);
                }
                self.emit_interrupt_updates().await;
                break;
            }

            for task in &tasks {
                self.emit(self.task_event(task, TaskPhase::Created)).await;
            }

            match self.execute_step(&tasks).await? {
                StepExecution::Paused => break,
                StepExecution::Completed(writes_per_task) => {
                    let executed: Vec<ExecutedTask> = tasks
                        .iter()
                        .zip(writes_per_task)
                        .map(|(task, writes)| ExecutedTask {
                            name: task.name.clone(),
                            triggers: task.barrier_triggers(),
                            writes,
                        })
                        .collect();
                    let outcome = apply_writes(
                        &mut self.checkpoint,
                        &mut self.channels,
                        &executed,
                        &self.graph.nodes,
                        &self.graph.version_fn,
                        IdleNotify::AllChannels,
                    )?;
                    if !outcome.managed_writes.is_empty() {
                        tracing::warn!(
                            target: "stategraph::run",
                            count = outcome.managed_writes.len(),
                            "dropping writes to undeclared channels"
                        );
                        self.emit(StreamEvent::Debug {
                            namespace: self.namespace(),
                            message: format!(
                                "dropped {} writes to undeclared channels",
                                outcome.managed_writes.len()
                            ),
                        })
                        .await;
                    }

                    let mut metadata = CheckpointMetadata::new(CheckpointSource::Loop, self.step);
                    for task in &executed {
                        metadata
                            .writes
                            .insert(task.name.clone(), serde_json::to_value(&task.writes)?);
                    }
                    self.commit(metadata).await?;
                    self.pending_writes.clear();

                    self.emit(StreamEvent::Values {
                        namespace: self.namespace(),
                        step: self.step,
                        values: self.output_values(),
                    })
                    .await;
                    let updates: FxHashMap<String, Vec<ChannelWrite>> = executed
                        .iter()
                        .map(|task| (task.name.clone(), task.writes.clone()))
                        .collect();
                    self.emit(StreamEvent::Updates {
                        namespace: self.namespace(),
                        step: self.step,
                        updates,
                    })
                    .await;
                    if self.modes.contains(&StreamMode::Checkpoints) {
                        let next = prepare_tasks(
                            &self.checkpoint,
                            &self.channels,
                            &self.graph.nodes,
                            self.step + 1,
                            &self.config.checkpoint_ns,
                            &[],
                        )
                        .into_iter()
                        .map(|task| task.name)
                        .collect();
                        self.emit(StreamEvent::Checkpoints {
                            namespace: self.namespace(),
                            step: self.step,
                            checkpoint: self.checkpoint.clone(),
                            next,
                        })
                        .await;
                    }

                    steps_executed += 1;
                    self.step += 1;

                    let after_hits: Vec<Interrupt> = tasks
                        .iter()
                        .filter(|task| self.graph.interrupt_after.contains(&task.name))
                        .map(|task| {
                            Interrupt::breakpoint(task.id.clone(), json!({"node": task.name}))
                        })
                        .collect();
                    if !after_hits.is_empty() {
                        self.interrupts.extend(after_hits);
                        self.emit_interrupt_updates().await;
                        break;
                    }
                }
            }
        }

        Ok(RunOutput {
            values: self.output_values(),
            interrupts: self.interrupts.clone(),
        })
    }

    /// Run one superstep's tasks concurrently, persisting each task's
    /// writes as it completes.
    async fn execute_step(&mut self, tasks: &[PregelTask]) -> Result<StepExecution, GraphError> {
        let mut results: Vec<Option<Vec<ChannelWrite>>> = vec![None; tasks.len()];

        let mut readable = FxHashMap::default();
        for (name, channel) in &self.channels {
            if let Ok(value) = channel.get() {
                readable.insert(name.clone(), value);
            }
        }
        let reader_values = Arc::new(readable);

        let mut join_set: JoinSet<(usize, Result<TaskOutcome, NodeError>)> = JoinSet::new();
        for (index, task) in tasks.iter().enumerate() {
            if let Some(writes) = &task.replayed_writes {
                results[index] = Some(writes.clone());
                self.emit(self.task_event(
                    task,
                    TaskPhase::Result {
                        cached: false,
                        replayed: true,
                    },
                ))
                .await;
                continue;
            }
            let Some(node) = self.graph.nodes.get(&task.name).cloned() else {
                continue;
            };
            let ctx = self.node_context(task, ChannelReader::new(Arc::clone(&reader_values)));
            let retry = node
                .retry_policy
                .clone()
                .or_else(|| self.graph.retry_policy.clone());
            let cache = self.graph.cache.clone();
            let input = task.input.clone();
            join_set.spawn(run_task(index, node, input, ctx, retry, cache));
        }

        let mut paused = false;
        let mut failure: Option<(String, NodeError)> = None;
        let mut cancelled = self.config.is_cancelled();
        let mut cancel_rx = self.config.cancel.clone();

        enum Waited {
            Cancelled,
            CancelSenderGone,
            Spurious,
            Joined(Option<Result<(usize, Result<TaskOutcome, NodeError>), tokio::task::JoinError>>),
        }

        while !cancelled {
            let waited = match &mut cancel_rx {
                Some(rx) => {
                    tokio::select! {
                        biased;
                        changed = rx.changed() => match changed {
                            Ok(()) if *rx.borrow() => Waited::Cancelled,
                            Ok(()) => Waited::Spurious,
                            Err(_) => Waited::CancelSenderGone,
                        },
                        joined = join_set.join_next() => Waited::Joined(joined),
                    }
                }
                None => Waited::Joined(join_set.join_next().await),
            };
            let joined = match waited {
                Waited::Cancelled => {
                    cancelled = true;
                    continue;
                }
                Waited::Spurious => continue,
                Waited::CancelSenderGone => {
                    cancel_rx = None;
                    continue;
                }
                Waited::Joined(joined) => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (index, result) = joined?;
            let task = &tasks[index];
            match result {
                Ok(outcome) => {
                    if let (Some(saver), Some(at)) = (&self.graph.saver, &self.at) {
                        if !outcome.writes.is_empty() {
                            saver.put_writes(at, outcome.writes.clone(), &task.id).await?;
                        }
                    }
                    self.emit(self.task_event(
                        task,
                        TaskPhase::Result {
                            cached: outcome.cached,
                            replayed: false,
                        },
                    ))
                    .await;
                    results[index] = Some(outcome.writes);
                }
                Err(NodeError::Interrupt(interrupt)) => {
                    // Persist the resume placeholder keyed by task id;
                    // Command::resume later upserts the real value over it.
                    let placeholder = vec![ChannelWrite::new(RESUME, Value::Null)];
                    if let (Some(saver), Some(at)) = (&self.graph.saver, &self.at) {
                        saver.put_writes(at, placeholder, &task.id).await?;
                    }
                    self.pending_writes.push(PendingWrite {
                        task_id: task.id.clone(),
                        channel: RESUME.to_string(),
                        value: Value::Null,
                        idx: -1,
                    });
                    self.emit(self.task_event(task, TaskPhase::Interrupted)).await;
                    self.interrupts.push(interrupt);
                    paused = true;
                }
                Err(NodeError::Cancelled) => {
                    cancelled = true;
                }
                Err(err) => {
                    self.emit(self.task_event(
                        task,
                        TaskPhase::Error {
                            message: err.to_string(),
                        },
                    ))
                    .await;
                    failure = Some((task.name.clone(), err));
                    break;
                }
            }
        }

        if cancelled || failure.is_some() {
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }
        if cancelled {
            self.emit(StreamEvent::Error {
                error: "cancelled".to_string(),
                message: "run aborted by cancellation signal".to_string(),
            })
            .await;
            return Err(GraphError::Cancelled);
        }
        if let Some((node, source)) = failure {
            self.emit(StreamEvent::Error {
                error: "node_error".to_string(),
                message: format!("node '{node}' failed: {source}"),
            })
            .await;
            return Err(GraphError::Node { node, source });
        }
        if paused {
            self.emit_interrupt_updates().await;
            return Ok(StepExecution::Paused);
        }
        Ok(StepExecution::Completed(
            results
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect(),
        ))
    }

    fn node_context(&self, task: &PregelTask, reader: ChannelReader) -> NodeContext {
        let parent_ns = &self.config.checkpoint_ns;
        let namespace = if parent_ns.is_empty() {
            task.id.clone()
        } else {
            format!("{parent_ns}{NS_SEP}{}", task.id)
        };
        NodeContext {
            task_id: task.id.clone(),
            node: task.name.clone(),
            step: self.step,
            namespace,
            resume: task.resume.clone(),
            writer: TaskWriter {
                namespace: self.namespace(),
                node: task.name.clone(),
                bus: Arc::clone(&self.bus),
                stream: self.stream_tx.clone(),
                modes: Arc::clone(&self.modes),
            },
            reader,
            cancel: self.config.cancel.clone(),
        }
    }

    /// Mint a child checkpoint id and persist it.
    async fn commit(&mut self, metadata: CheckpointMetadata) -> Result<(), GraphError> {
        self.checkpoint.id = new_checkpoint_id();
        self.checkpoint.ts = Utc::now();
        if let (Some(saver), Some(at)) = (&self.graph.saver, &self.at) {
            let next = saver
                .put(at, self.checkpoint.clone(), metadata)
                .await?;
            self.at = Some(next);
        }
        Ok(())
    }

    fn namespace(&self) -> Option<String> {
        if self.config.checkpoint_ns.is_empty() {
            None
        } else {
            Some(self.config.checkpoint_ns.clone())
        }
    }

    fn task_event(&self, task: &PregelTask, phase: TaskPhase) -> StreamEvent {
        StreamEvent::Tasks(TaskEvent {
            namespace: self.namespace(),
            step: self.step,
            task_id: task.id.clone(),
            node: task.name.clone(),
            phase,
        })
    }

    /// Interrupts surface on the `updates` stream under the reserved
    /// `__interrupt__` key.
    async fn emit_interrupt_updates(&mut self) {
        let Ok(value) = serde_json::to_value(&self.interrupts) else {
            return;
        };
        let mut updates = FxHashMap::default();
        updates.insert(
            INTERRUPT.to_string(),
            vec![ChannelWrite::new(INTERRUPT, value)],
        );
        self.emit(StreamEvent::Updates {
            namespace: self.namespace(),
            step: self.step,
            updates,
        })
        .await;
    }

    fn output_values(&self) -> FxHashMap<String, Value> {
        self.graph.read_values(&self.channels)
    }

    async fn emit(&self, event: StreamEvent) {
        if self.bus.emit(event.clone()).is_err() {
            tracing::trace!(target: "stategraph::run", "event bus has no subscribers");
        }
        let gated_out = event
            .mode()
            .is_some_and(|mode| !self.modes.contains(&mode));
        if gated_out {
            return;
        }
        if let Some(tx) = &self.stream_tx {
            if tx.send_async(event).await.is_err() {
                tracing::debug!(target: "stategraph::run", "run stream dropped; event lost");
            }
        }
    }
}

/// Execute one task: cache lookup, bound computation with retries, write
/// normalization, cache fill.
async fn run_task(
    index: usize,
    node: PregelNode,
    input: Value,
    ctx: NodeContext,
    retry: Option<RetryPolicy>,
    cache: Option<Arc<dyn CacheStore>>,
) -> (usize, Result<TaskOutcome, NodeError>) {
    let cache_key = node.cache_policy.as_ref().map(|p| p.key_for(&input));
    if let (Some(store), Some(key)) = (&cache, &cache_key) {
        if let Some(writes) = store.get(&node.name, key) {
            return (
                index,
                Ok(TaskOutcome {
                    writes,
                    cached: true,
                }),
            );
        }
    }

    let mut attempt: u32 = 1;
    let run_result = loop {
        match node.bound.run(input.clone(), ctx.clone()).await {
            Ok(update) => break Ok(update),
            Err(err) => {
                let retriable = retry
                    .as_ref()
                    .is_some_and(|policy| policy.should_retry(&err, attempt));
                if !retriable {
                    break Err(err);
                }
                let backoff = retry.as_ref().map(|p| p.backoff(attempt)).unwrap_or_default();
                tracing::warn!(
                    target: "stategraph::run",
                    node = %node.name,
                    attempt,
                    error = %err,
                    "task failed; retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    };

    let outcome = run_result.and_then(|update| {
        let writes = normalize_update(&node, update)?;
        if let (Some(store), Some(key)) = (&cache, &cache_key) {
            let ttl = node.cache_policy.as_ref().and_then(|p| p.ttl);
            store.put(&node.name, key, writes.clone(), ttl);
        }
        Ok(TaskOutcome {
            writes,
            cached: false,
        })
    });
    (index, outcome)
}

/// Flatten a node's update into channel writes, enforcing the declared
/// writer set.
fn normalize_update(node: &PregelNode, update: NodeUpdate) -> Result<Vec<ChannelWrite>, NodeError> {
    let writes = match update {
        NodeUpdate::Writes(writes) => writes,
        NodeUpdate::Command(command) => {
            let mut writes = command.update;
            for send in command.goto {
                writes.push(ChannelWrite::new(TASKS, serde_json::to_value(&send)?));
            }
            // Command::resume is an input-surface concern; a node signals
            // pauses with ctx.interrupt instead.
            writes
        }
    };
    if !node.writers.is_empty() {
        for write in &writes {
            if write.channel != TASKS && !node.writers.iter().any(|c| c == &write.channel) {
                return Err(NodeError::Validation(format!(
                    "node '{}' may not write to channel '{}'",
                    node.name, write.channel
                )));
            }
        }
    }
    Ok(writes)
}
