#![cfg(feature = "sqlite")]

mod common;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::OrderState;
use flowstitch::position::FlowPosition;
use flowstitch::progress::ForEachProgress;
use flowstitch::snapshot::{FlowSnapshot, FlowStatus};
use flowstitch::store::{SnapshotStore, SqliteSnapshotStore, StoreError};
use flowstitch::wait::{BranchSignal, WaitCondition, WaitKind};

async fn store_in(dir: &tempfile::TempDir) -> SqliteSnapshotStore {
    let path = dir.path().join("flows.db");
    SqliteSnapshotStore::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap()
}

#[tokio::test]
async fn snapshots_survive_a_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_in(&dir).await;
        let snap = FlowSnapshot::new("p1", &OrderState::default()).unwrap();
        assert!(store.create(&snap).await.unwrap());
    }
    let store = store_in(&dir).await;
    let loaded = store.get("p1").await.unwrap().unwrap();
    assert_eq!(loaded.flow_id, "p1");
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.status, FlowStatus::Running);
}

#[tokio::test]
async fn create_and_update_follow_the_optimistic_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;

    let mut snap = FlowSnapshot::new("p2", &OrderState::default()).unwrap();
    assert!(store.create(&snap).await.unwrap());
    assert!(!store.create(&snap).await.unwrap());

    snap.status = FlowStatus::Completed;
    assert!(store.update(&snap).await.unwrap());
    assert!(!store.update(&snap).await.unwrap());

    let stored = store.get("p2").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.status, FlowStatus::Completed);

    assert!(store.delete("p2").await.unwrap());
    assert!(!store.delete("p2").await.unwrap());
}

#[tokio::test]
async fn wait_conditions_roundtrip_and_count_signals() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;

    let condition = WaitCondition::new(
        "c1",
        "p3",
        FlowPosition::from_path(vec![0]),
        WaitKind::All,
        vec!["a".into(), "b".into()],
        Duration::from_secs(30),
        false,
    );
    store.set_wait_condition(&condition).await.unwrap();

    let update = store
        .update_wait_condition("c1", BranchSignal::ok("a", json!("x")))
        .await
        .unwrap();
    assert!(!update.is_complete);

    // Duplicate branch signals never double-count.
    let update = store
        .update_wait_condition("c1", BranchSignal::ok("a", json!("y")))
        .await
        .unwrap();
    assert_eq!(update.results.len(), 1);

    let update = store
        .update_wait_condition("c1", BranchSignal::ok("b", json!("z")))
        .await
        .unwrap();
    assert!(update.is_complete);

    let unknown = store
        .update_wait_condition("c1", BranchSignal::ok("zz", json!(0)))
        .await;
    assert!(matches!(unknown, Err(StoreError::UnknownBranch { .. })));

    store.clear_wait_condition("c1").await.unwrap();
    assert!(store.wait_condition("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn expired_conditions_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;

    let stale = WaitCondition::new(
        "stale",
        "p4",
        FlowPosition::from_path(vec![0]),
        WaitKind::Any,
        vec!["a".into()],
        Duration::ZERO,
        false,
    );
    store.set_wait_condition(&stale).await.unwrap();

    let expired = store
        .timed_out_wait_conditions(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].correlation_id, "stale");
}

#[tokio::test]
async fn foreach_progress_upserts() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;

    let mut progress = ForEachProgress::new("p5", "1", 4);
    store.save_foreach_progress(&progress).await.unwrap();
    progress.record_success(0, Some(json!({ "ok": true })));
    store.save_foreach_progress(&progress).await.unwrap();

    let loaded = store.foreach_progress("p5", "1").await.unwrap().unwrap();
    assert_eq!(loaded, progress);

    store.clear_foreach_progress("p5", "1").await.unwrap();
    assert!(store.foreach_progress("p5", "1").await.unwrap().is_none());
}
