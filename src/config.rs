//! Per-run configuration.
//!
//! A [`RunConfig`] addresses a thread (`thread_id` + `checkpoint_ns`,
//! optionally pinned to a `checkpoint_id` for time travel and forking) and
//! carries the run-level knobs: recursion limit, stream-mode selection,
//! tags/metadata, and the cancellation signal.

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;

use crate::types::StreamMode;

/// Default maximum number of supersteps per run.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Configuration for one invocation of a graph.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Thread identity: runs sharing a thread share a linear checkpoint
    /// history. Required whenever a checkpoint saver is attached.
    pub thread_id: Option<String>,
    /// Namespace distinguishing nested (subgraph) checkpoints on the same
    /// thread. The root graph uses the empty namespace.
    pub checkpoint_ns: String,
    /// Pin the run to a specific checkpoint instead of the thread's
    /// latest. Invoking from an older checkpoint forks the history.
    pub checkpoint_id: Option<String>,
    /// Maximum number of supersteps before the run fails with a
    /// recursion error.
    pub recursion_limit: usize,
    /// Event families emitted on the run stream.
    pub stream_modes: Vec<StreamMode>,
    pub tags: Vec<String>,
    pub metadata: FxHashMap<String, Value>,
    /// External abort signal: flip the paired `watch::Sender` to `true`
    /// to cancel the run.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            checkpoint_ns: String::new(),
            checkpoint_id: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            stream_modes: vec![StreamMode::Values],
            tags: Vec::new(),
            metadata: FxHashMap::default(),
            cancel: None,
        }
    }
}

impl RunConfig {
    /// Config addressing `thread_id` with defaults everywhere else.
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = checkpoint_ns.into();
        self
    }

    #[must_use]
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    #[must_use]
    pub fn with_recursion_limit(mut self, recursion_limit: usize) -> Self {
        self.recursion_limit = recursion_limit;
        self
    }

    #[must_use]
    pub fn with_stream_modes<I>(mut self, modes: I) -> Self
    where
        I: IntoIterator<Item = StreamMode>,
    {
        self.stream_modes = modes.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// `true` once the cancellation signal fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }
}
