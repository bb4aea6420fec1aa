mod common;

use serde_json::json;

use common::OrderState;
use flowstitch::builder::BuildError;
use flowstitch::bus::FlowRequest;
use flowstitch::flow::FlowConfig;
use flowstitch::position::FlowPosition;

#[test]
fn empty_flow_is_rejected() {
    let result = FlowConfig::<OrderState>::builder("empty").build();
    assert!(matches!(result, Err(BuildError::EmptyFlow { name }) if name == "empty"));
}

#[test]
fn break_if_outside_a_loop_is_rejected() {
    let result = FlowConfig::<OrderState>::builder("orphan")
        .mutate(|s| s.counter += 1)
        .decide(|d| d.when(|s| s.counter > 0, |seq| seq.break_if(|_| true)))
        .build();
    assert!(matches!(
        result,
        Err(BuildError::OrphanLoopControl { kind: "break-if" })
    ));
}

#[test]
fn loop_controls_are_valid_inside_loop_branches() {
    let result = FlowConfig::<OrderState>::builder("nested-break")
        .while_loop(
            |s| s.counter < 10,
            |body| {
                body.mutate(|s| s.counter += 1)
                    .decide(|d| d.when(|s| s.counter == 5, |seq| seq.break_if(|_| true)))
            },
        )
        .build();
    assert!(result.is_ok());
}

#[test]
fn join_branches_reset_loop_scope() {
    let result = FlowConfig::<OrderState>::builder("branch-scope")
        .while_loop(
            |s| s.counter < 3,
            |body| {
                body.mutate(|s| s.counter += 1).when_all(|j| {
                    j.branch("inner", |b| b.steps(|seq| seq.continue_if(|_| true)))
                })
            },
        )
        .build();
    assert!(matches!(
        result,
        Err(BuildError::OrphanLoopControl {
            kind: "continue-if"
        })
    ));
}

#[test]
fn for_each_requires_a_dispatch() {
    let result = FlowConfig::<OrderState>::builder("undispatched")
        .for_each(|_| vec![json!(1)], |f| f.continue_on_failure())
        .build();
    assert!(matches!(result, Err(BuildError::MissingDispatch)));
}

#[test]
fn duplicate_join_branch_names_are_rejected() {
    let result = FlowConfig::<OrderState>::builder("dupes")
        .when_all(|j| {
            j.branch("same", |b| b.awaits_signal())
                .branch("same", |b| b.awaits_signal())
        })
        .build();
    assert!(matches!(result, Err(BuildError::DuplicateBranch { name }) if name == "same"));
}

#[test]
fn empty_loop_body_is_rejected() {
    let result = FlowConfig::<OrderState>::builder("hollow")
        .while_loop(|s| s.counter < 1, |body| body)
        .build();
    assert!(matches!(
        result,
        Err(BuildError::EmptyBody { context: "while loop" })
    ));
}

#[test]
fn non_awaiting_join_branch_needs_steps() {
    let result = FlowConfig::<OrderState>::builder("hollow-branch")
        .when_any(|j| j.branch("nothing", |b| b))
        .build();
    assert!(matches!(
        result,
        Err(BuildError::EmptyBody {
            context: "join branch"
        })
    ));
}

#[test]
fn built_flows_resolve_their_own_positions() {
    let flow = FlowConfig::<OrderState>::builder("resolvable")
        .mutate(|s| s.counter = 0)
        .decide(|d| {
            d.when(
                |s| s.total > 100.0,
                |seq| seq.send(|_| FlowRequest::notification("review")),
            )
            .otherwise(|seq| seq.mutate(|s| s.notes.push("auto".into())))
        })
        .build()
        .unwrap();

    // 1 = the decide step, 1 = the otherwise branch, 0 = its first step.
    let chain = flow.resolve(&FlowPosition::from_path(vec![1, 1, 0])).unwrap();
    assert_eq!(chain, vec!["if", "mutate"]);

    assert!(flow.resolve(&FlowPosition::from_path(vec![7])).is_err());
    assert!(flow.resolve(&FlowPosition::from_path(vec![0, 0])).is_err());
}
