//! SQLite-backed checkpoint saver.
//!
//! Durable implementation of the [`CheckpointSaver`] contract over an
//! `sqlx` pool. The wire layout is two tables:
//!
//! - `checkpoints(thread_id, checkpoint_ns, checkpoint_id,
//!   parent_checkpoint_id, type, checkpoint, metadata)` — composite PK on
//!   the first three; the checkpoint and metadata columns hold the serde
//!   JSON of the in-memory model.
//! - `checkpoint_writes(thread_id, checkpoint_ns, checkpoint_id, task_id,
//!   idx, channel, type, value)` — intermediate writes, composite PK on
//!   all non-value columns; `idx >= 0` rows are insert-once, negative
//!   sentinel rows upsert.
//!
//! When the `sqlite-migrations` feature is enabled (default) the embedded
//! migrations run on connect; disabling it assumes external schema
//! orchestration. Schema versioning bookkeeping lives in `sqlx`'s
//! `_sqlx_migrations` table.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;

use super::saver::{metadata_matches, write_idx};
use super::{
    Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointSaver, CheckpointTuple, ListOptions,
    PendingWrite, SaverError,
};
use crate::types::{ChannelWrite, SendPacket, TASKS};

fn backend_err(context: &str, err: sqlx::Error) -> SaverError {
    SaverError::backend(format!("{context}: {err}"))
}

/// Durable saver over a SQLite database.
pub struct SqliteSaver {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSaver").finish()
    }
}

impl SqliteSaver {
    /// Connect to (or create) a SQLite database.
    /// Example URLs: `sqlite://graph.db`, `sqlite::memory:`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, SaverError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| backend_err("connect", e))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| SaverError::backend(format!("migration failure: {e}")))?;
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Resolve a database URL from the environment (`STATEGRAPH_SQLITE_URL`,
    /// falling back to `SQLITE_DB_NAME`, then `stategraph.db`).
    #[must_use]
    pub fn resolve_database_url(provided: Option<String>) -> String {
        if let Some(url) = provided {
            return url;
        }
        dotenvy::dotenv().ok();
        std::env::var("STATEGRAPH_SQLITE_URL").unwrap_or_else(|_| {
            let file =
                std::env::var("SQLITE_DB_NAME").unwrap_or_else(|_| "stategraph.db".to_string());
            format!("sqlite://{file}")
        })
    }

    async fn writes_for(
        &self,
        at: &CheckpointRef,
        checkpoint_id: &str,
    ) -> Result<Vec<PendingWrite>, SaverError> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, idx, channel, value
            FROM checkpoint_writes
            WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
            ORDER BY task_id, idx
            "#,
        )
        .bind(&at.thread_id)
        .bind(&at.checkpoint_ns)
        .bind(checkpoint_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend_err("select writes", e))?;

        let mut writes = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row
                .try_get("value")
                .map_err(|e| backend_err("read write value", e))?;
            writes.push(PendingWrite {
                task_id: row
                    .try_get("task_id")
                    .map_err(|e| backend_err("read task_id", e))?,
                channel: row
                    .try_get("channel")
                    .map_err(|e| backend_err("read channel", e))?,
                value: serde_json::from_str(&raw)?,
                idx: row.try_get("idx").map_err(|e| backend_err("read idx", e))?,
            });
        }
        Ok(writes)
    }

    async fn tuple_from_row(
        &self,
        at: &CheckpointRef,
        row: &SqliteRow,
    ) -> Result<CheckpointTuple, SaverError> {
        let checkpoint_json: String = row
            .try_get("checkpoint")
            .map_err(|e| backend_err("read checkpoint", e))?;
        let metadata_json: String = row
            .try_get("metadata")
            .map_err(|e| backend_err("read metadata", e))?;
        let parent_id: Option<String> = row
            .try_get("parent_checkpoint_id")
            .map_err(|e| backend_err("read parent id", e))?;
        let mut checkpoint: Checkpoint = serde_json::from_str(&checkpoint_json)?;
        let metadata: CheckpointMetadata = serde_json::from_str(&metadata_json)?;

        if checkpoint.pending_sends.is_empty() {
            if let Some(parent_id) = &parent_id {
                for write in self.writes_for(at, parent_id).await? {
                    if write.channel == TASKS {
                        let send: SendPacket = serde_json::from_value(write.value)?;
                        checkpoint.pending_sends.push(send);
                    }
                }
            }
        }

        let pending_writes = self.writes_for(at, &checkpoint.id).await?;
        Ok(CheckpointTuple {
            thread_id: at.thread_id.clone(),
            checkpoint_ns: at.checkpoint_ns.clone(),
            checkpoint,
            metadata,
            parent_id,
            pending_writes,
        })
    }
}

#[async_trait]
impl CheckpointSaver for SqliteSaver {
    #[instrument(skip(self), err)]
    async fn get_tuple(&self, at: &CheckpointRef) -> Result<Option<CheckpointTuple>, SaverError> {
        let row = if let Some(checkpoint_id) = &at.checkpoint_id {
            sqlx::query(
                r#"
                SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
                FROM checkpoints
                WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
                "#,
            )
            .bind(&at.thread_id)
            .bind(&at.checkpoint_ns)
            .bind(checkpoint_id)
            .fetch_optional(&*self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
                FROM checkpoints
                WHERE thread_id = ?1 AND checkpoint_ns = ?2
                ORDER BY checkpoint_id DESC
                LIMIT 1
                "#,
            )
            .bind(&at.thread_id)
            .bind(&at.checkpoint_ns)
            .fetch_optional(&*self.pool)
            .await
        }
        .map_err(|e| backend_err("select checkpoint", e))?;

        match row {
            Some(row) => Ok(Some(self.tuple_from_row(at, &row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, options), err)]
    async fn list(
        &self,
        at: &CheckpointRef,
        options: ListOptions,
    ) -> Result<BoxStream<'static, Result<CheckpointTuple, SaverError>>, SaverError> {
        let rows = if let Some(before) = &options.before {
            sqlx::query(
                r#"
                SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
                FROM checkpoints
                WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id < ?3
                ORDER BY checkpoint_id DESC
                "#,
            )
            .bind(&at.thread_id)
            .bind(&at.checkpoint_ns)
            .bind(before)
            .fetch_all(&*self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
                FROM checkpoints
                WHERE thread_id = ?1 AND checkpoint_ns = ?2
                ORDER BY checkpoint_id DESC
                "#,
            )
            .bind(&at.thread_id)
            .bind(&at.checkpoint_ns)
            .fetch_all(&*self.pool)
            .await
        }
        .map_err(|e| backend_err("select checkpoints", e))?;

        let mut tuples = Vec::new();
        for row in rows {
            let tuple = self.tuple_from_row(at, &row).await?;
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

    #[instrument(skip(self, checkpoint, metadata), err)]
    async fn put(
        &self,
        at: &CheckpointRef,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointRef, SaverError> {
        let id = checkpoint.id.clone();
        let checkpoint_json = serde_json::to_string(&checkpoint)?;
        let metadata_json = serde_json::to_string(&metadata)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoints (
                thread_id, checkpoint_ns, checkpoint_id,
                parent_checkpoint_id, type, checkpoint, metadata
            ) VALUES (?1, ?2, ?3, ?4, 'json', ?5, ?6)
            "#,
        )
        .bind(&at.thread_id)
        .bind(&at.checkpoint_ns)
        .bind(&id)
        .bind(at.checkpoint_id.as_deref())
        .bind(&checkpoint_json)
        .bind(&metadata_json)
        .execute(&*self.pool)
        .await
        .map_err(|e| backend_err("insert checkpoint", e))?;
        Ok(at.at(id))
    }

    #[instrument(skip(self, writes), err)]
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_err("tx begin", e))?;
        for (position, write) in writes.into_iter().enumerate() {
            let idx = write_idx(&write.channel, position);
            let value_json = serde_json::to_string(&write.value)?;
            // Sentinel rows (idx < 0) upsert; sequenced rows are
            // insert-once so retries never clobber the first result.
            let sql = if idx < 0 {
                r#"
                INSERT OR REPLACE INTO checkpoint_writes (
                    thread_id, checkpoint_ns, checkpoint_id,
                    task_id, idx, channel, type, value
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'json', ?7)
                "#
            } else {
                r#"
                INSERT OR IGNORE INTO checkpoint_writes (
                    thread_id, checkpoint_ns, checkpoint_id,
                    task_id, idx, channel, type, value
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'json', ?7)
                "#
            };
            sqlx::query(sql)
                .bind(&at.thread_id)
                .bind(&at.checkpoint_ns)
                .bind(&checkpoint_id)
                .bind(task_id)
                .bind(idx)
                .bind(&write.channel)
                .bind(&value_json)
                .execute(&mut *tx)
                .await
                .map_err(|e| backend_err("insert write", e))?;
        }
        tx.commit().await.map_err(|e| backend_err("tx commit", e))?;
        Ok(())
    }
}
