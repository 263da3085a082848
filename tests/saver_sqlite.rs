#![cfg(feature = "sqlite")]

use futures_util::StreamExt;
use serde_json::json;
use stategraph::checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointSaver, CheckpointSource, ListOptions,
    SqliteSaver,
};
use stategraph::types::{ChannelVersion, ChannelWrite, RESUME, SendPacket, TASKS};

async fn fresh_saver() -> SqliteSaver {
    SqliteSaver::connect("sqlite::memory:").await.unwrap()
}

fn meta(source: CheckpointSource, step: i64) -> CheckpointMetadata {
    CheckpointMetadata::new(source, step)
}

#[tokio::test]
async fn round_trips_checkpoints_structurally() {
    let saver = fresh_saver().await;
    let base = CheckpointRef::new("t", "");
    let mut cp = Checkpoint::empty();
    cp.channel_values.insert("x".to_string(), json!(false));
    cp.channel_values.insert("y".to_string(), json!(""));
    cp.channel_versions
        .insert("x".to_string(), ChannelVersion::Int(3));
    cp.channel_versions
        .insert("y".to_string(), ChannelVersion::Str("4.suffix".to_string()));
    cp.versions_seen.insert("node".to_string(), {
        let mut seen = rustc_hash::FxHashMap::default();
        seen.insert("x".to_string(), ChannelVersion::Int(2));
        seen
    });
    let expected = cp.clone();

    let at = saver
        .put(&base, cp, meta(CheckpointSource::Input, -1))
        .await
        .unwrap();
    let tuple = saver.get_tuple(&at).await.unwrap().unwrap();
    assert_eq!(tuple.checkpoint, expected);
    assert_eq!(tuple.metadata.step, -1);
    assert_eq!(tuple.metadata.source, CheckpointSource::Input);
}

#[tokio::test]
async fn latest_resolution_and_listing() {
    let saver = fresh_saver().await;
    let base = CheckpointRef::new("t", "");
    let first = Checkpoint::empty();
    let first_id = first.id.clone();
    let at = saver
        .put(&base, first, meta(CheckpointSource::Input, -1))
        .await
        .unwrap();
    let second = Checkpoint::empty();
    let second_id = second.id.clone();
    saver
        .put(&at, second, meta(CheckpointSource::Loop, 0))
        .await
        .unwrap();

    let latest = saver.get_tuple(&base).await.unwrap().unwrap();
    assert_eq!(latest.checkpoint.id, second_id);
    assert_eq!(latest.parent_id, Some(first_id.clone()));

    let listed: Vec<_> = saver
        .list(&base, ListOptions::default())
        .await
        .unwrap()
        .collect()
        .await;
    let ids: Vec<String> = listed
        .into_iter()
        .map(|t| t.unwrap().checkpoint.id)
        .collect();
    assert_eq!(ids, vec![second_id.clone(), first_id.clone()]);

    let filtered: Vec<_> = saver
        .list(
            &base,
            ListOptions::default().with_filter("source", json!("input")),
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(filtered.len(), 1);

    let paged: Vec<_> = saver
        .list(&base, ListOptions::default().with_before(second_id))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].as_ref().unwrap().checkpoint.id, first_id);
}

#[tokio::test]
async fn writes_idempotence_and_sentinel_upsert() {
    let saver = fresh_saver().await;
    let base = CheckpointRef::new("t", "");
    let at = saver
        .put(&base, Checkpoint::empty(), meta(CheckpointSource::Input, -1))
        .await
        .unwrap();

    saver
        .put_writes(&at, vec![ChannelWrite::new("x", json!(1))], "task-1")
        .await
        .unwrap();
    saver
        .put_writes(&at, vec![ChannelWrite::new("x", json!(999))], "task-1")
        .await
        .unwrap();
    saver
        .put_writes(
            &at,
            vec![ChannelWrite::new(RESUME, serde_json::Value::Null)],
            "task-1",
        )
        .await
        .unwrap();
    saver
        .put_writes(&at, vec![ChannelWrite::new(RESUME, json!("Ada"))], "task-1")
        .await
        .unwrap();

    let tuple = saver.get_tuple(&at).await.unwrap().unwrap();
    let rows: Vec<_> = tuple
        .pending_writes
        .iter()
        .map(|w| (w.channel.as_str(), w.value.clone(), w.idx))
        .collect();
    assert_eq!(
        rows,
        vec![(RESUME, json!("Ada"), -1), ("x", json!(1), 0)]
    );
}

#[tokio::test]
async fn checkpoints_survive_reconnection() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("graph.db").display()
    );
    let base = CheckpointRef::new("t", "");
    let mut cp = Checkpoint::empty();
    cp.channel_values.insert("x".to_string(), json!(1));
    let expected_id = cp.id.clone();

    {
        let saver = SqliteSaver::connect(&url).await.unwrap();
        saver
            .put(&base, cp, meta(CheckpointSource::Input, -1))
            .await
            .unwrap();
    }

    let reopened = SqliteSaver::connect(&url).await.unwrap();
    let tuple = reopened.get_tuple(&base).await.unwrap().unwrap();
    assert_eq!(tuple.checkpoint.id, expected_id);
    assert_eq!(tuple.checkpoint.channel_values["x"], json!(1));
}

#[tokio::test]
async fn pending_sends_reconstruct_from_parent_writes() {
    let saver = fresh_saver().await;
    let base = CheckpointRef::new("t", "");
    let at = saver
        .put(&base, Checkpoint::empty(), meta(CheckpointSource::Input, -1))
        .await
        .unwrap();
    saver
        .put_writes(
            &at,
            vec![ChannelWrite::new(
                TASKS,
                serde_json::to_value(SendPacket::new("worker", json!({"n": 1}))).unwrap(),
            )],
            "task-1",
        )
        .await
        .unwrap();
    saver
        .put(&at, Checkpoint::empty(), meta(CheckpointSource::Loop, 0))
        .await
        .unwrap();

    let tuple = saver.get_tuple(&base).await.unwrap().unwrap();
    assert_eq!(
        tuple.checkpoint.pending_sends,
        vec![SendPacket::new("worker", json!({"n": 1}))]
    );
}
