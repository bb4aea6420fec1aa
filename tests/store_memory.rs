mod common;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::OrderState;
use flowstitch::position::FlowPosition;
use flowstitch::progress::ForEachProgress;
use flowstitch::snapshot::{FlowSnapshot, FlowStatus};
use flowstitch::store::{InMemorySnapshotStore, SnapshotStore, StoreError};
use flowstitch::wait::{BranchSignal, WaitCondition, WaitKind};

fn snapshot(flow_id: &str) -> FlowSnapshot {
    FlowSnapshot::new(flow_id, &OrderState::default()).unwrap()
}

fn condition(correlation_id: &str, timeout: Duration) -> WaitCondition {
    WaitCondition::new(
        correlation_id,
        "flow-1",
        FlowPosition::from_path(vec![1]),
        WaitKind::All,
        vec!["a".into(), "b".into()],
        timeout,
        false,
    )
}

#[tokio::test]
async fn create_is_first_writer_wins() {
    let store = InMemorySnapshotStore::new();
    assert!(store.create(&snapshot("s1")).await.unwrap());
    assert!(!store.create(&snapshot("s1")).await.unwrap());
}

#[tokio::test]
async fn update_guards_on_version_and_bumps_it() {
    let store = InMemorySnapshotStore::new();
    let mut snap = snapshot("s2");
    store.create(&snap).await.unwrap();

    snap.status = FlowStatus::Suspended;
    assert!(store.update(&snap).await.unwrap());

    let stored = store.get("s2").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.status, FlowStatus::Suspended);

    // The held copy is now stale; the conditional write must refuse it.
    assert!(!store.update(&snap).await.unwrap());
}

#[tokio::test]
async fn update_of_a_missing_snapshot_is_refused() {
    let store = InMemorySnapshotStore::new();
    assert!(!store.update(&snapshot("ghost")).await.unwrap());
}

#[tokio::test]
async fn delete_reports_whether_anything_existed() {
    let store = InMemorySnapshotStore::new();
    store.create(&snapshot("s3")).await.unwrap();
    assert!(store.delete("s3").await.unwrap());
    assert!(!store.delete("s3").await.unwrap());
    assert!(store.get("s3").await.unwrap().is_none());
}

#[tokio::test]
async fn wait_condition_updates_are_idempotent_per_branch() {
    let store = InMemorySnapshotStore::new();
    store
        .set_wait_condition(&condition("c1", Duration::from_secs(60)))
        .await
        .unwrap();

    let first = store
        .update_wait_condition("c1", BranchSignal::ok("a", json!(1)))
        .await
        .unwrap();
    assert!(!first.is_complete);
    assert_eq!(first.results.len(), 1);

    let repeat = store
        .update_wait_condition("c1", BranchSignal::ok("a", json!(2)))
        .await
        .unwrap();
    assert!(!repeat.is_complete);
    assert_eq!(repeat.results.len(), 1);
    assert_eq!(repeat.results[0].value, json!(1));

    let done = store
        .update_wait_condition("c1", BranchSignal::ok("b", json!(3)))
        .await
        .unwrap();
    assert!(done.is_complete);
    assert_eq!(done.results.len(), 2);
}

#[tokio::test]
async fn unknown_waits_and_branches_error() {
    let store = InMemorySnapshotStore::new();
    let missing = store
        .update_wait_condition("nope", BranchSignal::ok("a", json!(0)))
        .await;
    assert!(matches!(missing, Err(StoreError::UnknownWait { .. })));

    store
        .set_wait_condition(&condition("c2", Duration::from_secs(60)))
        .await
        .unwrap();
    let stranger = store
        .update_wait_condition("c2", BranchSignal::ok("zz", json!(0)))
        .await;
    assert!(matches!(stranger, Err(StoreError::UnknownBranch { .. })));
}

#[tokio::test]
async fn timed_out_conditions_are_filtered_by_the_probe_time() {
    let store = InMemorySnapshotStore::new();
    store
        .set_wait_condition(&condition("fresh", Duration::from_secs(3600)))
        .await
        .unwrap();
    store
        .set_wait_condition(&condition("stale", Duration::ZERO))
        .await
        .unwrap();

    let expired = store
        .timed_out_wait_conditions(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].correlation_id, "stale");

    // Resolved conditions never count as timed out.
    store
        .update_wait_condition("stale", BranchSignal::ok("a", json!(0)))
        .await
        .unwrap();
    store
        .update_wait_condition("stale", BranchSignal::ok("b", json!(0)))
        .await
        .unwrap();
    let expired = store
        .timed_out_wait_conditions(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert!(expired.is_empty());
}

#[tokio::test]
async fn foreach_progress_is_keyed_by_flow_and_step() {
    let store = InMemorySnapshotStore::new();
    let mut progress = ForEachProgress::new("flow-1", "2", 3);
    progress.record_success(0, None);
    store.save_foreach_progress(&progress).await.unwrap();

    let loaded = store.foreach_progress("flow-1", "2").await.unwrap().unwrap();
    assert_eq!(loaded, progress);
    assert!(store.foreach_progress("flow-1", "3").await.unwrap().is_none());
    assert!(store.foreach_progress("flow-2", "2").await.unwrap().is_none());

    store.clear_foreach_progress("flow-1", "2").await.unwrap();
    assert!(store.foreach_progress("flow-1", "2").await.unwrap().is_none());
}
