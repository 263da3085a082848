//! The storage contract consumed by the runtime.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use super::{Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointTuple};
use crate::types::{ChannelWrite, INTERRUPT, RESUME};

/// Errors from checkpoint savers.
#[derive(Debug, Error, Diagnostic)]
pub enum SaverError {
    /// The run config carries no `thread_id`.
    #[error("a checkpoint saver requires a thread_id in the run config")]
    #[diagnostic(
        code(stategraph::saver::missing_thread),
        help("Set RunConfig::thread_id (e.g. RunConfig::for_thread(\"t1\")) when a saver is attached.")
    )]
    MissingThread,

    /// Storage backend error (database, filesystem, etc.).
    #[error("backend error: {message}")]
    #[diagnostic(code(stategraph::saver::backend))]
    Backend { message: String },

    /// Persisted data failed to (de)serialize.
    #[error("persistence serialization failed: {source}")]
    #[diagnostic(
        code(stategraph::saver::serde),
        help("The stored shape no longer matches the checkpoint model; check migrations.")
    )]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

impl SaverError {
    pub fn backend(message: impl Into<String>) -> Self {
        SaverError::Backend {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SaverError {
    fn from(source: serde_json::Error) -> Self {
        SaverError::Serde { source }
    }
}

/// Options for [`CheckpointSaver::list`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Only return checkpoints created strictly before this id.
    pub before: Option<String>,
    /// Maximum number of tuples to yield.
    pub limit: Option<usize>,
    /// Structural equality filters applied to the metadata (field name →
    /// expected JSON value).
    pub filter: FxHashMap<String, Value>,
}

impl ListOptions {
    #[must_use]
    pub fn with_before(mut self, before: impl Into<String>) -> Self {
        self.before = Some(before.into());
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter.insert(field.into(), value);
        self
    }
}

/// Persistent storage for checkpoints and intermediate task writes.
///
/// # Contract
///
/// - `put` is atomic within a `(thread_id, checkpoint_ns)` partition; the
///   parent id is taken from the input ref.
/// - `get_tuple` with no pinned id returns the latest checkpoint by
///   lexicographic id. When the stored checkpoint carries no pending
///   sends, the saver reconstructs them from the writes recorded against
///   the *parent* checkpoint on the reserved `__tasks__` channel — this is
///   the two-table model that makes partial-step failures recoverable.
/// - `put_writes` is idempotent per `(task_id, idx)` for `idx >= 0` and
///   upserts the negative sentinel rows (see [`write_idx`]).
/// - `list` yields newest first; `filter` is structural equality against
///   metadata fields.
///
/// Round-trip fidelity is structural equality of the checkpoint, not byte
/// identity.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch one checkpoint tuple: the pinned id if the ref carries one,
    /// else the partition's latest. `None` when the partition is empty.
    async fn get_tuple(&self, at: &CheckpointRef) -> Result<Option<CheckpointTuple>, SaverError>;

    /// Iterate the partition's checkpoints, newest first.
    async fn list(
        &self,
        at: &CheckpointRef,
        options: ListOptions,
    ) -> Result<BoxStream<'static, Result<CheckpointTuple, SaverError>>, SaverError>;

    /// Persist a checkpoint and return the ref now pinned to it.
    async fn put(
        &self,
        at: &CheckpointRef,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointRef, SaverError>;

    /// Persist intermediate writes for one task against the ref's pinned
    /// checkpoint.
    async fn put_writes(
        &self,
        at: &CheckpointRef,
        writes: Vec<ChannelWrite>,
        task_id: &str,
    ) -> Result<(), SaverError>;
}

/// Storage index for the `position`-th write of a task.
///
/// Reserved control channels use negative sentinels so a later call can
/// replace them in place (a resume value overwriting its placeholder);
/// everything else keeps its sequence position and is immutable once
/// stored.
#[must_use]
pub fn write_idx(channel: &str, position: usize) -> i64 {
    match channel {
        RESUME => -1,
        INTERRUPT => -2,
        _ => position as i64,
    }
}

/// Structural-equality metadata filter shared by saver implementations.
pub(crate) fn metadata_matches(
    metadata: &CheckpointMetadata,
    filter: &FxHashMap<String, Value>,
) -> Result<bool, SaverError> {
    if filter.is_empty() {
        return Ok(true);
    }
    let as_value = serde_json::to_value(metadata)?;
    Ok(filter
        .iter()
        .all(|(field, expected)| as_value.get(field) == Some(expected)))
}
