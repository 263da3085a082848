//! In-process checkpoint saver.
//!
//! Volatile, keeps full history per `(thread_id, checkpoint_ns)`
//! partition. Fast and dependency-free; the reference implementation of
//! the [`CheckpointSaver`] contract and the saver used by the runtime
//! tests.

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use async_trait::async_trait;

use super::saver::{metadata_matches, write_idx};
use super::{
    Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointSaver, CheckpointTuple, ListOptions,
    PendingWrite, SaverError,
};
use crate::types::{ChannelWrite, SendPacket, TASKS};

#[derive(Clone, Debug)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    parent_id: Option<String>,
}

#[derive(Default)]
struct ThreadStore {
    checkpoints: FxHashMap<String, StoredCheckpoint>,
    /// Intermediate writes keyed by checkpoint id.
    writes: FxHashMap<String, Vec<PendingWrite>>,
}

impl ThreadStore {
    fn latest_id(&self) -> Option<String> {
        self.checkpoints.keys().max().cloned()
    }

    fn writes_for(&self, checkpoint_id: &str) -> Vec<PendingWrite> {
        let mut writes = self
            .writes
            .get(checkpoint_id)
            .cloned()
            .unwrap_or_default();
        writes.sort_by(|a, b| (&a.task_id, a.idx).cmp(&(&b.task_id, b.idx)));
        writes
    }

    fn tuple(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointTuple>, SaverError> {
        let Some(stored) = self.checkpoints.get(checkpoint_id) else {
            return Ok(None);
        };
        let mut checkpoint = stored.checkpoint.clone();
        // Two-table recovery: a checkpoint persisted without its sends
        // inherits them from the parent's __tasks__ writes.
        if checkpoint.pending_sends.is_empty() {
            if let Some(parent_id) = &stored.parent_id {
                for write in self.writes_for(parent_id) {
                    if write.channel == TASKS {
                        let send: SendPacket = serde_json::from_value(write.value)?;
                        checkpoint.pending_sends.push(send);
                    }
                }
            }
        }
        Ok(Some(CheckpointTuple {
            thread_id: thread_id.to_string(),
            checkpoint_ns: checkpoint_ns.to_string(),
            checkpoint,
            metadata: stored.metadata.clone(),
            parent_id: stored.parent_id.clone(),
            pending_writes: self.writes_for(checkpoint_id),
        }))
    }
}

/// Volatile saver storing full checkpoint history in process memory.
#[derive(Default)]
pub struct InMemorySaver {
    inner: RwLock<FxHashMap<(String, String), ThreadStore>>,
}

impl InMemorySaver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(at: &CheckpointRef) -> (String, String) {
        (at.thread_id.clone(), at.checkpoint_ns.clone())
    }
}

#[async_trait]
impl CheckpointSaver for InMemorySaver {
    async fn get_tuple(&self, at: &CheckpointRef) -> Result<Option<CheckpointTuple>, SaverError> {
        let inner = self.inner.read();
        let Some(store) = inner.get(&Self::partition(at)) else {
            return Ok(None);
        };
        let Some(id) = at.checkpoint_id.clone().or_else(|| store.latest_id()) else {
            return Ok(None);
        };
        store.tuple(&at.thread_id, &at.checkpoint_ns, &id)
    }

    async fn list(
        &self,
        at: &CheckpointRef,
        options: ListOptions,
    ) -> Result<BoxStream<'static, Result<CheckpointTuple, SaverError>>, SaverError> {
        let inner = self.inner.read();
        let Some(store) = inner.get(&Self::partition(at)) else {
            return Ok(stream::iter(Vec::new()).boxed());
        };
        let mut ids: Vec<&String> = store.checkpoints.keys().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut tuples = Vec::new();
        for id in ids {
            if let Some(before) = &options.before {
                if id.as_str() >= before.as_str() {
                    continue;
                }
            }
            let Some(tuple) = store.tuple(&at.thread_id, &at.checkpoint_ns, id)? else {
                continue;
            };
            if !metadata_matches(&tuple.metadata, &options.filter)? {
                continue;
            }
            tuples.push(Ok(tuple));
            if options.limit.is_some_and(|limit| tuples.len() >= limit) {
                break;
            }
        }
        Ok(stream::iter(tuples).boxed())
    }

    async fn put(
        &self,
        at: &CheckpointRef,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointRef, SaverError> {
        let id = checkpoint.id.clone();
        let mut inner = self.inner.write();
        let store = inner.entry(Self::partition(at)).or_default();
        store.checkpoints.insert(
            id.clone(),
            StoredCheckpoint {
                checkpoint,
                metadata,
                parent_id: at.checkpoint_id.clone(),
            },
        );
        Ok(at.at(id))
    }

    async fn put_writes(
        &self,
        at: &CheckpointRef,
        writes: Vec<ChannelWrite>,
        task_id: &str,
    ) -> Result<(), SaverError> {
        let checkpoint_id = at
            .checkpoint_id
            .clone()
            .ok_or_else(|| SaverError::backend("put_writes requires a pinned checkpoint id"))?;
        let mut inner = self.inner.write();
        let store = inner.entry(Self::partition(at)).or_default();
        let rows = store.writes.entry(checkpoint_id).or_default();
        for (position, write) in writes.into_iter().enumerate() {
            let idx = write_idx(&write.channel, position);
            let existing = rows
                .iter_mut()
                .find(|row| row.task_id == task_id && row.idx == idx);
            match existing {
                Some(row) if idx < 0 => {
                    row.channel = write.channel;
                    row.value = write.value;
                }
                Some(_) => {} // idx >= 0 rows are immutable: first write wins
                None => rows.push(PendingWrite {
                    task_id: task_id.to_string(),
                    channel: write.channel,
                    value: write.value,
                    idx,
                }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use serde_json::json;

    fn refs() -> CheckpointRef {
        CheckpointRef::new("t1", "")
    }

    #[tokio::test]
    async fn latest_wins_without_pinned_id() {
        let saver = InMemorySaver::new();
        let first = Checkpoint::empty();
        let second = Checkpoint::empty();
        let at = saver
            .put(
                &refs(),
                first.clone(),
                CheckpointMetadata::new(CheckpointSource::Input, -1),
            )
            .await
            .unwrap();
        saver
            .put(
                &at,
                second.clone(),
                CheckpointMetadata::new(CheckpointSource::Loop, 0),
            )
            .await
            .unwrap();
        let tuple = saver.get_tuple(&refs()).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, second.id);
        assert_eq!(tuple.parent_id, Some(first.id));
    }

    #[tokio::test]
    async fn put_writes_keeps_first_value_per_index() {
        let saver = InMemorySaver::new();
        let cp = Checkpoint::empty();
        let at = saver
            .put(
                &refs(),
                cp,
                CheckpointMetadata::new(CheckpointSource::Input, -1),
            )
            .await
            .unwrap();
        saver
            .put_writes(&at, vec![ChannelWrite::new("x", json!(1))], "task-a")
            .await
            .unwrap();
        saver
            .put_writes(&at, vec![ChannelWrite::new("x", json!(99))], "task-a")
            .await
            .unwrap();
        let tuple = saver.get_tuple(&at).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(tuple.pending_writes[0].value, json!(1));
    }
}
