//! Core types for the stategraph runtime.
//!
//! This module defines the fundamental vocabulary shared by every layer of
//! the engine: reserved channel names, the comparable channel version, the
//! dynamic-dispatch [`SendPacket`], the resume/update [`Command`], the
//! structured [`Interrupt`] pause signal, and stream-mode selection.
//!
//! For the channel algebra itself see [`crate::channels`]; for the
//! checkpoint data model see [`crate::checkpoint`].

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Virtual channel carrying the run input.
pub const START: &str = "__start__";
/// Virtual channel projecting the run output.
pub const END: &str = "__end__";
/// Virtual channel holding the previous run's output for functional-style graphs.
pub const PREVIOUS: &str = "__previous__";
/// Virtual channel surfacing interrupts to the caller.
pub const INTERRUPT: &str = "__interrupt__";
/// Virtual channel that buffers [`SendPacket`] writes across a superstep boundary.
pub const TASKS: &str = "__tasks__";
/// Virtual channel keyed by task id that carries resume values after an interrupt.
pub const RESUME: &str = "__resume__";
/// Task-kind marker for dynamically dispatched (send-driven) tasks.
pub const PUSH: &str = "__pregel_push__";
/// Task-kind marker for trigger-driven tasks.
pub const PULL: &str = "__pregel_pull__";

/// Separator between levels of a subgraph namespace path.
pub const NS_SEP: &str = ":";

/// Channel names reserved by the runtime. None may be used as a user
/// channel name; [`crate::pregel::PregelBuilder`] rejects them.
pub const RESERVED_CHANNELS: &[&str] =
    &[START, END, PREVIOUS, INTERRUPT, TASKS, RESUME, PUSH, PULL];

/// Returns `true` if `name` is reserved by the runtime.
#[must_use]
pub fn is_reserved_channel(name: &str) -> bool {
    RESERVED_CHANNELS.contains(&name)
}

/// A monotonic, comparable channel version.
///
/// Backends may persist versions either as integers or as strings
/// (lexicographically ordered); the runtime compares both forms. Int/Int
/// compares numerically, Str/Str lexicographically, and mixed pairs
/// compare by the string's leading integer with integers ordered first on
/// ties. A saver must stay consistent within a thread.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(u64),
    Str(String),
}

impl ChannelVersion {
    /// The null version: smaller than any version a successful update produces.
    #[must_use]
    pub fn null() -> Self {
        ChannelVersion::Int(0)
    }

    /// Numeric magnitude used for cross-encoding comparison and for the
    /// default `next_version` computation. Strings contribute their
    /// leading decimal digits (`"7.extra"` → 7); non-numeric strings
    /// contribute 0.
    #[must_use]
    pub fn magnitude(&self) -> u64 {
        match self {
            ChannelVersion::Int(n) => *n,
            ChannelVersion::Str(s) => {
                let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            }
        }
    }
}

impl Default for ChannelVersion {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChannelVersion::Int(a), ChannelVersion::Int(b)) => a.cmp(b),
            (ChannelVersion::Str(a), ChannelVersion::Str(b)) => a.cmp(b),
            (a, b) => a
                .magnitude()
                .cmp(&b.magnitude())
                .then_with(|| match (a, b) {
                    (ChannelVersion::Int(_), ChannelVersion::Str(_)) => Ordering::Less,
                    (ChannelVersion::Str(_), ChannelVersion::Int(_)) => Ordering::Greater,
                    _ => Ordering::Equal,
                }),
        }
    }
}

impl fmt::Display for ChannelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelVersion::Int(n) => write!(f, "{n}"),
            ChannelVersion::Str(s) => write!(f, "{s}"),
        }
    }
}

/// The greatest version among `versions`, or `None` when the iterator is
/// empty. Works across mixed int/str encodings.
pub fn max_channel_version<'a, I>(versions: I) -> Option<&'a ChannelVersion>
where
    I: IntoIterator<Item = &'a ChannelVersion>,
{
    versions.into_iter().max()
}

/// A single write destined for a named channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelWrite {
    pub channel: String,
    pub value: Value,
}

impl ChannelWrite {
    pub fn new(channel: impl Into<String>, value: Value) -> Self {
        Self {
            channel: channel.into(),
            value,
        }
    }
}

/// Instruction to dispatch `node` with `args` in the next superstep,
/// independent of channel triggers.
///
/// Send packets are produced by writing to the reserved [`TASKS`] channel
/// (or returning [`Command::goto`]) and are carried across exactly one
/// superstep boundary inside the checkpoint's `pending_sends`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendPacket {
    pub node: String,
    pub args: Value,
}

impl SendPacket {
    pub fn new(node: impl Into<String>, args: Value) -> Self {
        Self {
            node: node.into(),
            args,
        }
    }
}

/// Optional run input controlling interrupt-resume and state mutation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Value handed back to the `interrupt()` call that paused the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,
    /// State updates applied before the next superstep.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<ChannelWrite>,
    /// Nodes to dispatch next, regardless of channel triggers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goto: Vec<SendPacket>,
}

impl Command {
    /// A command that resumes an interrupted run with `value`.
    #[must_use]
    pub fn resume(value: Value) -> Self {
        Self {
            resume: Some(value),
            ..Default::default()
        }
    }

    /// A command that applies `update` before the next superstep.
    #[must_use]
    pub fn update(update: Vec<ChannelWrite>) -> Self {
        Self {
            update,
            ..Default::default()
        }
    }

    /// A command that dispatches the given sends.
    #[must_use]
    pub fn goto(goto: Vec<SendPacket>) -> Self {
        Self {
            goto,
            ..Default::default()
        }
    }
}

/// Where an interrupt originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptWhen {
    /// Raised from inside a running node via `NodeContext::interrupt`.
    During,
    /// Raised by an `interrupt_before` / `interrupt_after` breakpoint.
    Breakpoint,
}

/// Structured pause signal surfaced to the caller.
///
/// The `id` is the deterministic id of the task that raised the interrupt,
/// which is also the key under which the resume value is persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: String,
    pub value: Value,
    pub when: InterruptWhen,
}

impl Interrupt {
    pub fn during(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
            when: InterruptWhen::During,
        }
    }

    pub fn breakpoint(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
            when: InterruptWhen::Breakpoint,
        }
    }
}

/// Which event families a run emits on its stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamMode {
    /// Post-step snapshot of channel values.
    Values,
    /// Per-node writes produced in the step.
    Updates,
    /// Message chunks emitted by nodes while they run.
    Messages,
    /// User chunks written through the task writer.
    Custom,
    /// Full checkpoint plus next-task preview after each step.
    Checkpoints,
    /// Task creation, result, and error events.
    Tasks,
    /// Internal diagnostic payloads.
    Debug,
    /// Structured errors.
    Errors,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_int() {
        assert!(ChannelVersion::Int(2) > ChannelVersion::Int(1));
        assert!(ChannelVersion::null() < ChannelVersion::Int(1));
    }

    #[test]
    fn version_ordering_str() {
        assert!(ChannelVersion::Str("2.a".into()) > ChannelVersion::Str("10.z".into()));
        assert!(ChannelVersion::Str("".into()) < ChannelVersion::Str("1".into()));
    }

    #[test]
    fn version_ordering_mixed_uses_leading_integer() {
        assert!(ChannelVersion::Int(3) > ChannelVersion::Str("2.abc".into()));
        assert!(ChannelVersion::Int(2) < ChannelVersion::Str("2.abc".into()));
    }

    #[test]
    fn version_serde_untagged() {
        let v: ChannelVersion = serde_json::from_str("7").unwrap();
        assert_eq!(v, ChannelVersion::Int(7));
        let v: ChannelVersion = serde_json::from_str("\"7.x\"").unwrap();
        assert_eq!(v, ChannelVersion::Str("7.x".into()));
    }

    #[test]
    fn reserved_channel_lookup() {
        assert!(is_reserved_channel("__tasks__"));
        assert!(!is_reserved_channel("messages"));
    }

    #[test]
    fn max_version_across_encodings() {
        let versions = [
            ChannelVersion::Int(1),
            ChannelVersion::Str("3.q".into()),
            ChannelVersion::Int(2),
        ];
        assert_eq!(
            max_channel_version(versions.iter()),
            Some(&ChannelVersion::Str("3.q".into()))
        );
    }
}
