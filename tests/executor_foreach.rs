mod common;

use serde_json::json;

use common::{harness, OrderState, RecordingBus};
use flowstitch::bus::{BusError, FlowRequest};
use flowstitch::flow::FlowConfig;
use flowstitch::position::FlowPosition;
use flowstitch::progress::ForEachProgress;
use flowstitch::snapshot::{FlowSnapshot, FlowStatus};
use flowstitch::store::SnapshotStore;

fn shipping_flow(configure: impl FnOnce(flowstitch::builder::ForEachBuilder<OrderState>) -> flowstitch::builder::ForEachBuilder<OrderState>) -> FlowConfig<OrderState> {
    FlowConfig::<OrderState>::builder("shipping")
        .for_each(
            |_| vec![json!("a"), json!("b"), json!("c"), json!("d")],
            |f| {
                configure(
                    f.dispatch(|_, item| FlowRequest::new("ship", json!({ "sku": item })))
                        .on_item_success(|s, item, _| {
                            s.processed.push(item.as_str().unwrap_or("?").to_string())
                        })
                        .on_item_fail(|s, item, _| {
                            s.failures.push(item.as_str().unwrap_or("?").to_string())
                        }),
                )
            },
        )
        .build()
        .unwrap()
}

fn flaky_bus() -> RecordingBus {
    RecordingBus::new().on("ship", |payload| {
        if payload["sku"] == json!("b") {
            Err(BusError::rejected("carrier-error", "no capacity"))
        } else {
            Ok(json!({ "ok": true }))
        }
    })
}

#[tokio::test]
async fn sequential_processing_visits_every_item_in_order() {
    let flow = shipping_flow(|f| f);
    let (executor, bus, store) = harness(flow, RecordingBus::new());

    let result = executor.run("fe1", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Completed);
    assert_eq!(result.state.processed, vec!["a", "b", "c", "d"]);
    assert_eq!(bus.count("ship"), 4);

    // A fully successful step leaves no progress record behind.
    assert!(store.foreach_progress("fe1", "0").await.unwrap().is_none());
}

#[tokio::test]
async fn first_failure_stops_the_step_by_default() {
    let flow = shipping_flow(|f| f);
    let (executor, bus, store) = harness(flow, flaky_bus());

    let result = executor.run("fe2", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "carrier-error");
    assert_eq!(result.state.processed, vec!["a"]);
    assert_eq!(bus.count("ship"), 2);

    // The progress record survives for inspection and recovery.
    let progress = store.foreach_progress("fe2", "0").await.unwrap().unwrap();
    assert!(progress.completed.contains(&0));
    assert_eq!(progress.failed, vec![1]);
}

#[tokio::test]
async fn continue_on_failure_records_and_keeps_going() {
    let flow = shipping_flow(|f| f.continue_on_failure());
    let (executor, bus, store) = harness(flow, flaky_bus());

    let result = executor.run("fe3", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Completed);
    assert_eq!(result.state.processed, vec!["a", "c", "d"]);
    assert_eq!(result.state.failures, vec!["b"]);
    assert_eq!(bus.count("ship"), 4);

    let progress = store.foreach_progress("fe3", "0").await.unwrap().unwrap();
    assert_eq!(progress.failed, vec![1]);
    assert_eq!(progress.completed.len(), 3);
}

#[tokio::test]
async fn resume_processes_exactly_the_unfinished_items() {
    let flow = shipping_flow(|f| f);
    let (executor, bus, store) = harness(flow, RecordingBus::new());

    // Seed the store the way an interrupted run leaves it: a running
    // snapshot anchored at the for-each node plus progress for two of the
    // four items.
    let mut snapshot = FlowSnapshot::new("fe4", &OrderState::default()).unwrap();
    snapshot.position = FlowPosition::from_path(vec![0]);
    assert!(store.create(&snapshot).await.unwrap());
    let mut progress = ForEachProgress::new("fe4", "0", 4);
    progress.record_success(0, None);
    progress.record_success(1, None);
    store.save_foreach_progress(&progress).await.unwrap();

    let result = executor.resume("fe4").await.unwrap();
    assert_eq!(result.status, FlowStatus::Completed);
    // Four items, two already done: exactly two dispatches.
    assert_eq!(bus.count("ship"), 2);
    assert_eq!(result.state.processed, vec!["c", "d"]);
    assert!(store.foreach_progress("fe4", "0").await.unwrap().is_none());
}

#[tokio::test]
async fn parallel_waves_process_every_item() {
    let flow = shipping_flow(|f| f.parallelism(3));
    let (executor, bus, _) = harness(flow, RecordingBus::new());

    let result = executor.run("fe5", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Completed);
    assert_eq!(bus.count("ship"), 4);
    // Write-back is serial in wave order even when dispatch is concurrent.
    assert_eq!(result.state.processed, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn batched_processing_completes_and_clears_progress() {
    let flow = shipping_flow(|f| f.batch_size(2));
    let (executor, bus, store) = harness(flow, RecordingBus::new());

    let result = executor.run("fe6", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Completed);
    assert_eq!(bus.count("ship"), 4);
    assert!(store.foreach_progress("fe6", "0").await.unwrap().is_none());
}

#[tokio::test]
async fn batch_size_bounds_persistence_even_under_parallelism() {
    let flow = shipping_flow(|f| f.parallelism(2).batch_size(4));
    let (executor, bus, store) = harness(flow, RecordingBus::new());

    let result = executor.run("fe8", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Completed);
    assert_eq!(bus.count("ship"), 4);
    assert_eq!(result.state.processed, vec!["a", "b", "c", "d"]);
    assert!(store.foreach_progress("fe8", "0").await.unwrap().is_none());

    // One batch of four means exactly one mid-step persist: create,
    // anchor, batch, terminal.
    let snapshot = store.get("fe8").await.unwrap().unwrap();
    assert_eq!(snapshot.version, 4);
}

#[tokio::test]
async fn streaming_drops_item_results_from_progress() {
    let flow = shipping_flow(|f| f.streaming().continue_on_failure());
    let (executor, _, store) = harness(flow, flaky_bus());

    let result = executor.run("fe7", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Completed);
    let progress = store.foreach_progress("fe7", "0").await.unwrap().unwrap();
    assert!(progress.item_results.is_empty());
}
