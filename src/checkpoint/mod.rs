//! Checkpoint data model and persistence contract.
//!
//! A [`Checkpoint`] is an immutable snapshot of the graph between
//! supersteps: committed channel values, per-channel version vectors, the
//! `versions_seen` gating map, and the pending sends produced last step.
//! Checkpoints form a linked list per `(thread_id, checkpoint_ns)`
//! partition via their parent id; forking a thread simply creates a second
//! child of an older checkpoint.
//!
//! Intermediate task writes are persisted *separately* from checkpoints
//! (see [`PendingWrite`]) so a crash mid-step loses no completed work: on
//! resume, tasks whose deterministic ids already have recorded writes are
//! not re-executed.
//!
//! Storage backends implement [`CheckpointSaver`]; [`InMemorySaver`] is
//! the in-process reference implementation and `SqliteSaver` (feature
//! `sqlite`) the durable one.

mod memory;
mod saver;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemorySaver;
pub use saver::{CheckpointSaver, ListOptions, SaverError, write_idx};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSaver;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::RunConfig;
use crate::types::{ChannelVersion, SendPacket};

/// Current checkpoint format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Mint a new time-ordered checkpoint id.
///
/// UUIDv6 encodes the timestamp in its most significant bits, so the
/// lexicographic order of the hyphenated form equals creation order —
/// which is what makes "latest checkpoint" a plain string comparison for
/// every backend.
#[must_use]
pub fn new_checkpoint_id() -> String {
    let node_id: [u8; 6] = rand::random();
    Uuid::now_v6(&node_id).to_string()
}

/// Immutable snapshot of the graph between supersteps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version.
    pub v: u32,
    /// Time-ordered id; lexicographic order equals creation order.
    pub id: String,
    /// Creation timestamp.
    pub ts: DateTime<Utc>,
    /// Last committed value per non-empty channel.
    #[serde(default)]
    pub channel_values: FxHashMap<String, Value>,
    /// Monotonic version per channel that ever committed a write. This is
    /// a superset of `channel_values`: consumed ephemeral channels keep
    /// their version so triggering stays monotonic.
    #[serde(default)]
    pub channel_versions: FxHashMap<String, ChannelVersion>,
    /// For each node, the channel versions it had observed when its writes
    /// were last applied. A node is eligible iff one of its trigger
    /// channels has advanced past this map.
    #[serde(default)]
    pub versions_seen: FxHashMap<String, FxHashMap<String, ChannelVersion>>,
    /// Sends produced last step, to be dispatched exactly once next step.
    #[serde(default)]
    pub pending_sends: Vec<SendPacket>,
}

impl Checkpoint {
    /// A fresh, empty checkpoint with a newly minted id.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            v: CHECKPOINT_FORMAT_VERSION,
            id: new_checkpoint_id(),
            ts: Utc::now(),
            channel_values: FxHashMap::default(),
            channel_versions: FxHashMap::default(),
            versions_seen: FxHashMap::default(),
            pending_sends: Vec::new(),
        }
    }

    /// The greatest committed channel version, if any channel ever
    /// committed a write.
    #[must_use]
    pub fn max_version(&self) -> Option<&ChannelVersion> {
        crate::types::max_channel_version(self.channel_versions.values())
    }

    /// The version of `channel` a given node last observed, or the null
    /// version when it never ran on it.
    #[must_use]
    pub fn seen_version(&self, node: &str, channel: &str) -> ChannelVersion {
        self.versions_seen
            .get(node)
            .and_then(|seen| seen.get(channel))
            .cloned()
            .unwrap_or_else(ChannelVersion::null)
    }
}

/// Provenance of a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Created from run input (step −1 of a fresh thread, or a new input
    /// on an existing one).
    Input,
    /// Committed by the loop at a superstep barrier.
    Loop,
    /// Produced by an external `update_state` call.
    Update,
    /// Copied from another thread/namespace.
    Fork,
}

/// Metadata persisted next to each checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    /// Superstep number (−1 for the input checkpoint).
    pub step: i64,
    /// Per-node summary of the writes committed at this step.
    #[serde(default)]
    pub writes: FxHashMap<String, Value>,
    /// Parent checkpoint id per namespace, carried so nested (subgraph)
    /// checkpoints can locate their ancestors.
    #[serde(default)]
    pub parents: FxHashMap<String, String>,
}

impl CheckpointMetadata {
    #[must_use]
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step,
            writes: FxHashMap::default(),
            parents: FxHashMap::default(),
        }
    }
}

/// One persisted intermediate write.
///
/// `idx >= 0` rows are immutable once written (first value wins), which is
/// what makes task retries idempotent at the saver. The `-1`/`-2` sentinel
/// rows used by the reserved resume/interrupt channels upsert instead, so
/// a `Command::resume` can replace a placeholder in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: Value,
    pub idx: i64,
}

/// Address of a checkpoint partition, optionally pinned to one id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CheckpointRef {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: Option<String>,
}

impl CheckpointRef {
    pub fn new(thread_id: impl Into<String>, checkpoint_ns: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: checkpoint_ns.into(),
            checkpoint_id: None,
        }
    }

    /// Derive the address from a run config. Fails when the config has no
    /// thread id, since savers always partition by thread.
    pub fn from_config(config: &RunConfig) -> Result<Self, SaverError> {
        let thread_id = config.thread_id.clone().ok_or(SaverError::MissingThread)?;
        Ok(Self {
            thread_id,
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: config.checkpoint_id.clone(),
        })
    }

    /// The same partition pinned to `checkpoint_id`.
    #[must_use]
    pub fn at(&self, checkpoint_id: impl Into<String>) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint_id.into()),
        }
    }

    /// The same partition with no pinned checkpoint (resolves to latest).
    #[must_use]
    pub fn latest(&self) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: None,
        }
    }
}

/// Everything a saver returns for one stored checkpoint.
#[derive(Clone, Debug)]
pub struct CheckpointTuple {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent_id: Option<String>,
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    /// Address of this tuple's checkpoint.
    #[must_use]
    pub fn checkpoint_ref(&self) -> CheckpointRef {
        CheckpointRef {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: Some(self.checkpoint.id.clone()),
        }
    }

    /// Address of the parent checkpoint, when one exists.
    #[must_use]
    pub fn parent_ref(&self) -> Option<CheckpointRef> {
        self.parent_id.as_ref().map(|id| CheckpointRef {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: Some(id.clone()),
        })
    }
}
