//! Channel algebra: typed accumulators with merge semantics.
//!
//! A channel is a named accumulator that defines how multiple writes within
//! one superstep combine, whether reading consumes the value, and how the
//! value is snapshotted into a checkpoint. The runtime never stores
//! channels directly in a checkpoint — it stores each channel's
//! [`Channel::checkpoint`] snapshot and rebuilds the live channel through
//! [`ChannelSpec::from_checkpoint`] on the next superstep or resume.
//!
//! # Variants
//!
//! - [`LastValue`]: one value, at most one write per step.
//! - [`AnyValue`]: one value, many writes allowed, last wins.
//! - [`EphemeralValue`]: like `LastValue` but cleared after one step.
//! - [`Topic`]: ordered multiset with optional `unique` / `accumulate`.
//! - [`BinaryOperatorAggregate`]: folds writes with a [`Reducer`].
//!
//! Emptiness is tracked separately from the value itself, so falsy values
//! (`0`, `""`, `false`, `null`) round-trip through checkpoints unchanged.

mod any_value;
mod binop;
mod ephemeral_value;
mod last_value;
mod topic;

pub use any_value::AnyValue;
pub use binop::BinaryOperatorAggregate;
pub use ephemeral_value::EphemeralValue;
pub use last_value::LastValue;
pub use topic::Topic;

use std::fmt;
use std::sync::Arc;

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::reducers::Reducer;

/// Errors produced by channel operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ChannelError {
    /// Read on a channel that holds no value. This is an expected
    /// control-flow signal: task-input resolution catches it to skip
    /// nodes whose inputs are not readable this step.
    #[error("channel is empty")]
    #[diagnostic(
        code(stategraph::channels::empty),
        help("The channel was never written, or its value was consumed this step.")
    )]
    EmptyChannel,

    /// A write violated the channel's arity or shape rules. Fatal for the
    /// offending task.
    #[error("invalid channel update: {message}")]
    #[diagnostic(code(stategraph::channels::invalid_update))]
    InvalidUpdate { message: String },
}

impl ChannelError {
    pub fn invalid_update(message: impl Into<String>) -> Self {
        ChannelError::InvalidUpdate {
            message: message.into(),
        }
    }
}

/// A typed accumulator over JSON values.
///
/// All methods are synchronous: channels are plain data manipulated by the
/// loop between task executions, never shared across tasks mid-step.
pub trait Channel: Send + Sync {
    /// Merge `writes` into the channel. Returns `true` iff the externally
    /// observable value changed — this is what drives the version bump.
    ///
    /// An empty `writes` is the end-of-step idle notification: channels
    /// with per-step state (ephemeral, non-accumulating topics) use it to
    /// advance, everything else reports `false`.
    fn update(&mut self, writes: Vec<Value>) -> Result<bool, ChannelError>;

    /// Current value, or [`ChannelError::EmptyChannel`].
    fn get(&self) -> Result<Value, ChannelError>;

    /// `true` iff [`Channel::get`] would succeed.
    fn is_available(&self) -> bool;

    /// Advance internal state for channels that are consumed on read.
    /// Returns `true` iff the observable value changed. Only the trigger
    /// channels of a task that actually ran are consumed.
    fn consume(&mut self) -> bool;

    /// Snapshot for persistence. Must round-trip exactly through
    /// [`ChannelSpec::from_checkpoint`], or fail with
    /// [`ChannelError::EmptyChannel`] when there is nothing to persist.
    fn checkpoint(&self) -> Result<Value, ChannelError>;

    fn clone_box(&self) -> Box<dyn Channel>;
}

impl Clone for Box<dyn Channel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Serializable description of a channel, used to build empty channels and
/// to rehydrate them from checkpoint snapshots.
///
/// A `ChannelSpec` is the graph-level declaration; the live [`Channel`]
/// values are per-run state. Reducers for [`ChannelSpec::BinaryOperator`]
/// live behind an `Arc` so specs clone cheaply into every run.
#[derive(Clone)]
pub enum ChannelSpec {
    LastValue,
    AnyValue,
    EphemeralValue,
    Topic {
        unique: bool,
        accumulate: bool,
    },
    BinaryOperator {
        reducer: Arc<dyn Reducer>,
        initial: Value,
    },
}

impl ChannelSpec {
    /// Topic with both flags off.
    #[must_use]
    pub fn topic() -> Self {
        ChannelSpec::Topic {
            unique: false,
            accumulate: false,
        }
    }

    /// Fold channel over `reducer`, starting from `initial`.
    #[must_use]
    pub fn binary_operator(reducer: Arc<dyn Reducer>, initial: Value) -> Self {
        ChannelSpec::BinaryOperator { reducer, initial }
    }

    /// Build an empty channel for this spec.
    #[must_use]
    pub fn build(&self) -> Box<dyn Channel> {
        match self {
            ChannelSpec::LastValue => Box::new(LastValue::new()),
            ChannelSpec::AnyValue => Box::new(AnyValue::new()),
            ChannelSpec::EphemeralValue => Box::new(EphemeralValue::new()),
            ChannelSpec::Topic { unique, accumulate } => {
                Box::new(Topic::new(*unique, *accumulate))
            }
            ChannelSpec::BinaryOperator { reducer, initial } => Box::new(
                BinaryOperatorAggregate::new(Arc::clone(reducer), initial.clone()),
            ),
        }
    }

    /// Rebuild a channel from a checkpoint snapshot. `None` produces an
    /// empty channel.
    pub fn from_checkpoint(&self, snapshot: Option<Value>) -> Result<Box<dyn Channel>, ChannelError> {
        let Some(snapshot) = snapshot else {
            return Ok(self.build());
        };
        Ok(match self {
            ChannelSpec::LastValue => Box::new(LastValue::from_checkpoint(snapshot)),
            ChannelSpec::AnyValue => Box::new(AnyValue::from_checkpoint(snapshot)),
            ChannelSpec::EphemeralValue => Box::new(EphemeralValue::from_checkpoint(snapshot)),
            ChannelSpec::Topic { unique, accumulate } => {
                Box::new(Topic::from_checkpoint(*unique, *accumulate, snapshot)?)
            }
            ChannelSpec::BinaryOperator { reducer, initial } => {
                Box::new(BinaryOperatorAggregate::from_checkpoint(
                    Arc::clone(reducer),
                    initial.clone(),
                    snapshot,
                ))
            }
        })
    }
}

impl fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelSpec::LastValue => write!(f, "LastValue"),
            ChannelSpec::AnyValue => write!(f, "AnyValue"),
            ChannelSpec::EphemeralValue => write!(f, "EphemeralValue"),
            ChannelSpec::Topic { unique, accumulate } => f
                .debug_struct("Topic")
                .field("unique", unique)
                .field("accumulate", accumulate)
                .finish(),
            ChannelSpec::BinaryOperator { reducer, .. } => f
                .debug_struct("BinaryOperator")
                .field("reducer", &reducer.name())
                .finish(),
        }
    }
}
