//! State merge strategies used by fold channels.
//!
//! A [`Reducer`] combines an accumulated value with one incoming write.
//! [`crate::channels::BinaryOperatorAggregate`] applies the reducer once
//! per write, in write order, so reducers should be associative for
//! predictable fan-in behavior.

mod builtin;

pub use builtin::{AppendItems, MapMerge, SumNumbers};

use serde_json::Value;

/// Folds one update into an accumulated value.
pub trait Reducer: Send + Sync {
    /// Stable, human-friendly identifier used in diagnostics.
    fn name(&self) -> &'static str;

    /// Combine `current` with `update` and return the new accumulated
    /// value.
    fn apply(&self, current: Value, update: Value) -> Value;
}
