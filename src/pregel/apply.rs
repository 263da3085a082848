//! Apply-writes: merging a superstep's task writes into the channels.
//!
//! This is the barrier at the end of a superstep. It runs with the loop's
//! exclusive ownership of the channels — tasks only ever see the
//! step-start snapshot, so a task's partial writes are never visible until
//! it completes.
//!
//! The sequence is fixed:
//!
//! 1. stamp `versions_seen` for every task trigger that exists,
//! 2. consume triggered channels (ephemeral reads advance their version),
//! 3. clear last step's pending sends once any task ran,
//! 4. route writes (sends to `pending_sends`, known channels batched,
//!    reserved tokens skipped, unknown channels returned to the caller),
//! 5. batch-update each written channel and bump its version,
//! 6. idle-notify so per-step state advances — every untouched channel at
//!    a superstep barrier, only the step's own trigger channels for
//!    synthetic external updates (see [`IdleNotify`]).

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::channels::{Channel, ChannelError};
use crate::checkpoint::Checkpoint;
use crate::node::PregelNode;
use crate::types::{
    ChannelVersion, ChannelWrite, SendPacket, TASKS, is_reserved_channel,
};

/// Produces the next version for a channel given the current maximum
/// committed version across all channels.
pub type VersionFn = Arc<dyn Fn(Option<&ChannelVersion>) -> ChannelVersion + Send + Sync>;

/// Default versioning: integers counting up from the current maximum.
#[must_use]
pub fn default_next_version(current: Option<&ChannelVersion>) -> ChannelVersion {
    ChannelVersion::Int(current.map_or(0, ChannelVersion::magnitude) + 1)
}

/// One completed task at the barrier: who ran, what triggered it, and the
/// writes it produced, in emission order.
#[derive(Clone, Debug)]
pub struct ExecutedTask {
    pub name: String,
    pub triggers: Vec<String>,
    pub writes: Vec<ChannelWrite>,
}

/// Scope of the end-of-step idle notification.
///
/// Ephemeral values and non-accumulating topics advance their per-step
/// state through `update(vec![])`. At a superstep barrier every channel
/// the step did not write gets notified. A synthetic external update
/// (`update_state`) is not a superstep: notifying channels it never
/// touched would wipe per-step state an in-flight thread still owns, so
/// it restricts the pass to its own trigger channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleNotify {
    /// Notify every channel not written this step.
    AllChannels,
    /// Notify only the step's (non-reserved, unwritten) trigger channels.
    TriggersOnly,
}

/// Result of applying one superstep's writes.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Channels whose version advanced this step, in bump order.
    pub updated_channels: Vec<String>,
    /// Writes to channels outside the known set, returned to the caller
    /// as managed-value writes.
    pub managed_writes: Vec<ChannelWrite>,
}

fn bump_version(checkpoint: &mut Checkpoint, channel: &str, next_version: &VersionFn) {
    let max = checkpoint.max_version().cloned();
    checkpoint
        .channel_versions
        .insert(channel.to_string(), next_version(max.as_ref()));
}

/// Merge `tasks`' writes into `channels`, advancing `checkpoint`'s version
/// maps in place.
///
/// Tasks must be passed in deterministic order (push tasks by send index,
/// then pull tasks by sorted node name); per-channel write order is by
/// task, then by write index within the task.
pub fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut FxHashMap<String, Box<dyn Channel>>,
    tasks: &[ExecutedTask],
    nodes: &FxHashMap<String, PregelNode>,
    next_version: &VersionFn,
    idle_notify: IdleNotify,
) -> Result<ApplyOutcome, ChannelError> {
    let mut outcome = ApplyOutcome::default();

    // 1. Each task observed its trigger channels at their start-of-step
    // versions; record that before any bumps happen below.
    for task in tasks {
        for trigger in &task.triggers {
            if let Some(version) = checkpoint.channel_versions.get(trigger).cloned() {
                checkpoint
                    .versions_seen
                    .entry(task.name.clone())
                    .or_default()
                    .insert(trigger.clone(), version);
            }
        }
    }

    // 2./3. Consume triggered channels; a consumption that changed the
    // value advances the version so downstream triggers observe it.
    let mut triggered: Vec<&String> = tasks
        .iter()
        .flat_map(|task| task.triggers.iter())
        .filter(|trigger| !is_reserved_channel(trigger))
        .collect();
    triggered.sort_unstable();
    triggered.dedup();
    for name in triggered {
        if let Some(channel) = channels.get_mut(name) {
            if channel.consume() {
                bump_version(checkpoint, name, next_version);
                outcome.updated_channels.push(name.clone());
            }
        }
    }

    let bump_step = tasks.iter().any(|task| !task.triggers.is_empty());
    if bump_step {
        // Last step's sends were dispatched exactly once; drop them
        // before collecting this step's.
        checkpoint.pending_sends.clear();
    }

    // 4. Route writes.
    let mut order: Vec<String> = Vec::new();
    let mut batched: FxHashMap<String, Vec<Value>> = FxHashMap::default();
    for task in tasks {
        for write in &task.writes {
            if write.channel == TASKS {
                let send: SendPacket =
                    serde_json::from_value(write.value.clone()).map_err(|_| {
                        ChannelError::invalid_update(format!(
                            "write to {TASKS} from node '{}' is not a send packet",
                            task.name
                        ))
                    })?;
                if !nodes.contains_key(&send.node) {
                    return Err(ChannelError::invalid_update(format!(
                        "send targets unknown node '{}'",
                        send.node
                    )));
                }
                checkpoint.pending_sends.push(send);
            } else if channels.contains_key(&write.channel) {
                if !batched.contains_key(&write.channel) {
                    order.push(write.channel.clone());
                }
                batched
                    .entry(write.channel.clone())
                    .or_default()
                    .push(write.value.clone());
            } else if is_reserved_channel(&write.channel) {
                // Control tokens (push/resume/interrupt) are handled by
                // the loop, not the channel algebra.
            } else {
                outcome.managed_writes.push(write.clone());
            }
        }
    }

    // 5. Batched updates, one per channel, version bump on change.
    for name in &order {
        let writes = batched.remove(name).unwrap_or_default();
        if let Some(channel) = channels.get_mut(name) {
            if channel.update(writes)? {
                bump_version(checkpoint, name, next_version);
                outcome.updated_channels.push(name.clone());
            }
        }
    }

    // 6. Idle-notify so per-step state (ephemeral values,
    // non-accumulating topics) advances.
    if bump_step {
        let mut names: Vec<String> = match idle_notify {
            IdleNotify::AllChannels => channels
                .keys()
                .filter(|name| !order.contains(name))
                .cloned()
                .collect(),
            IdleNotify::TriggersOnly => tasks
                .iter()
                .flat_map(|task| task.triggers.iter())
                .filter(|name| {
                    !is_reserved_channel(name)
                        && !order.contains(*name)
                        && channels.contains_key(*name)
                })
                .cloned()
                .collect(),
        };
        names.sort_unstable();
        names.dedup();
        for name in names {
            if let Some(channel) = channels.get_mut(&name) {
                if channel.update(Vec::new())? {
                    bump_version(checkpoint, &name, next_version);
                    outcome.updated_channels.push(name.clone());
                }
            }
        }
    }

    // Refresh the committed value map: non-empty channels snapshot in,
    // consumed ones drop out (their versions stay).
    checkpoint.channel_values.clear();
    for (name, channel) in channels.iter() {
        if let Ok(snapshot) = channel.checkpoint() {
            checkpoint.channel_values.insert(name.clone(), snapshot);
        }
    }

    Ok(outcome)
}
