mod common;

use std::time::Duration;

use common::{harness, OrderState, RecordingBus};
use flowstitch::flow::FlowConfig;
use flowstitch::governors::Governors;
use flowstitch::snapshot::FlowStatus;

#[tokio::test]
async fn iteration_limit_fails_runaway_loops() {
    let flow = FlowConfig::<OrderState>::builder("spinner")
        .with_governors(Governors::default().with_max_iterations(10))
        .while_loop(|_| true, |body| body.mutate(|s| s.counter += 1))
        .build()
        .unwrap();
    let (executor, _, _) = harness(flow, RecordingBus::new());

    let result = executor.run("g1", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Failed);
    assert!(!result.is_success());
    let error = result.error.unwrap();
    assert!(error.message.contains("iteration"));
    assert_eq!(result.state.counter, 10);
}

#[tokio::test]
async fn execution_timeout_fails_the_leg() {
    let flow = FlowConfig::<OrderState>::builder("instant-deadline")
        .with_governors(Governors::default().with_timeout(Duration::ZERO))
        .mutate(|s| s.counter = 1)
        .build()
        .unwrap();
    let (executor, _, _) = harness(flow, RecordingBus::new());

    let result = executor.run("g2", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Failed);
    let error = result.error.unwrap();
    assert!(error.message.contains("timeout"));
    // The deadline tripped before the first step ran.
    assert_eq!(result.state.counter, 0);
}

#[tokio::test]
async fn depth_limit_fails_deep_nesting() {
    let flow = FlowConfig::<OrderState>::builder("matryoshka")
        .with_governors(Governors::default().with_max_depth(3))
        .repeat(1, |outer| {
            outer.repeat(1, |inner| inner.mutate(|s| s.counter += 1))
        })
        .build()
        .unwrap();
    let (executor, _, _) = harness(flow, RecordingBus::new());

    let result = executor.run("g3", OrderState::default()).await.unwrap();
    assert_eq!(result.status, FlowStatus::Failed);
    let error = result.error.unwrap();
    assert!(error.message.contains("depth"));
}

#[test]
fn environment_overrides_take_effect() {
    std::env::set_var("FLOWSTITCH_MAX_DEPTH", "42");
    std::env::set_var("FLOWSTITCH_MAX_ITERATIONS", "7");
    std::env::set_var("FLOWSTITCH_TIMEOUT_SECS", "9");

    let g = Governors::from_env();
    assert_eq!(g.max_depth, 42);
    assert_eq!(g.max_iterations, 7);
    assert_eq!(g.timeout, Duration::from_secs(9));

    std::env::remove_var("FLOWSTITCH_MAX_DEPTH");
    std::env::remove_var("FLOWSTITCH_MAX_ITERATIONS");
    std::env::remove_var("FLOWSTITCH_TIMEOUT_SECS");
}
