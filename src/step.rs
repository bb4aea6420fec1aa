//! The step model: a tagged-variant tree describing a flow's logic.
//!
//! Each step kind is an enum variant carrying a per-kind payload struct, not
//! a trait object. The tree carries no execution behavior of its own; the
//! executor interprets it. Keeping the model a plain sum type makes positions
//! trivially comparable and replayable across restarts.
//!
//! Callback fields (`Predicate`, `Mutation`, projections, hooks) must behave
//! as pure functions of the state they receive: no hidden I/O, no ambient
//! clocks or randomness. The resume machinery re-evaluates some of them
//! against restored state and relies on getting identical answers. This is a
//! caller obligation; the type system cannot enforce it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::FlowRequest;
use crate::position::{FlowPosition, PositionError};
use crate::wait::{BranchSignal, WaitKind};

/// Boolean predicate over the flow state.
pub type Predicate<S> = Arc<dyn Fn(&S) -> bool + Send + Sync>;
/// Pure in-place state mutation.
pub type Mutation<S> = Arc<dyn Fn(&mut S) + Send + Sync>;
/// Builds the outgoing request for a `Send` step from current state.
pub type RequestFactory<S> = Arc<dyn Fn(&S) -> FlowRequest + Send + Sync>;
/// Folds a `Send` response back into state.
pub type ResponseProjection<S> = Arc<dyn Fn(&mut S, Value) + Send + Sync>;
/// Selects a repeat count from state, evaluated once at loop entry.
pub type CountSelector<S> = Arc<dyn Fn(&S) -> usize + Send + Sync>;
/// Selects the match value for a `Switch` step.
pub type CaseSelector<S> = Arc<dyn Fn(&S) -> Value + Send + Sync>;
/// Materializes the collection for a `ForEach` step.
pub type ItemSelector<S> = Arc<dyn Fn(&S) -> Vec<Value> + Send + Sync>;
/// Builds the per-item request for a `ForEach` step.
pub type ItemRequestFactory<S> = Arc<dyn Fn(&S, &Value) -> FlowRequest + Send + Sync>;
/// Per-item success hook: `(state, item, response)`.
pub type ItemSuccessHook<S> = Arc<dyn Fn(&mut S, &Value, &Value) + Send + Sync>;
/// Per-item failure hook: `(state, item, error message)`.
pub type ItemFailureHook<S> = Arc<dyn Fn(&mut S, &Value, &str) + Send + Sync>;
/// Supplies the completion value of a synchronous join branch.
pub type BranchYield<S> = Arc<dyn Fn(&S) -> Value + Send + Sync>;
/// Folds resolved branch signals back into state at join resolution.
pub type JoinCollector<S> = Arc<dyn Fn(&mut S, &[BranchSignal]) + Send + Sync>;

/// One node of the step tree.
pub enum Step<S> {
    /// Dispatch one external request, optionally projecting the response
    /// into state.
    Send(SendStep<S>),
    /// Pure state mutation, no I/O.
    Mutate(Mutation<S>),
    /// If/ElseIf/Else: ordered predicate arms, first match wins.
    If(IfStep<S>),
    /// Switch/Case/Default: selector evaluated once, value-matched cases.
    Switch(SwitchStep<S>),
    /// Collection processing with durable per-item progress.
    ForEach(ForEachStep<S>),
    /// While / DoWhile / Repeat loops.
    Loop(LoopStep<S>),
    /// Try / Catch / Finally structured error handling.
    Try(TryStep<S>),
    /// WhenAll / WhenAny fork-join backed by a durable wait condition.
    Join(JoinStep<S>),
    /// Break the innermost loop when the predicate holds.
    BreakIf(Predicate<S>),
    /// Skip to the next iteration of the innermost loop when the predicate
    /// holds.
    ContinueIf(Predicate<S>),
}

pub struct SendStep<S> {
    pub request: RequestFactory<S>,
    pub project: Option<ResponseProjection<S>>,
}

pub struct IfStep<S> {
    /// `(predicate, branch)` pairs evaluated top to bottom.
    pub arms: Vec<(Predicate<S>, Vec<Step<S>>)>,
    /// The Else branch, addressed by position component `arms.len()`.
    pub otherwise: Option<Vec<Step<S>>>,
}

pub struct SwitchStep<S> {
    pub selector: CaseSelector<S>,
    /// `(value, branch)` pairs; the first case equal to the selector value
    /// wins.
    pub cases: Vec<(Value, Vec<Step<S>>)>,
    /// The Default branch, addressed by position component `cases.len()`.
    pub default: Option<Vec<Step<S>>>,
}

pub enum LoopKind<S> {
    /// Condition before each iteration: zero-or-more executions.
    While(Predicate<S>),
    /// Condition after each iteration: one-or-more executions.
    DoWhile(Predicate<S>),
    /// Fixed iteration count, selector evaluated once at loop entry.
    Repeat(CountSelector<S>),
}

pub struct LoopStep<S> {
    pub kind: LoopKind<S>,
    pub body: Vec<Step<S>>,
}

/// One catch clause: `kind == None` is a catch-all.
pub struct CatchClause<S> {
    pub kind: Option<String>,
    pub handler: Vec<Step<S>>,
}

impl<S> CatchClause<S> {
    /// Exact-kind match; catch-all clauses match any non-fatal failure.
    pub fn matches(&self, failure_kind: &str) -> bool {
        match &self.kind {
            Some(kind) => kind == failure_kind,
            None => true,
        }
    }
}

pub struct TryStep<S> {
    pub body: Vec<Step<S>>,
    /// Evaluated in declared order; first matching clause handles the
    /// failure.
    pub catches: Vec<CatchClause<S>>,
    /// Runs on every exit path: success, caught failure, or just before an
    /// unmatched failure is rethrown.
    pub finally: Option<Vec<Step<S>>>,
}

pub struct JoinBranch<S> {
    pub name: String,
    pub steps: Vec<Step<S>>,
    /// When true the branch is completed only by an external signal; when
    /// false the executor records the branch's completion itself as soon as
    /// its steps finish.
    pub awaits_signal: bool,
    /// Result value of a self-completing branch (defaults to `null`).
    pub yields: Option<BranchYield<S>>,
}

pub struct JoinStep<S> {
    pub kind: WaitKind,
    pub branches: Vec<JoinBranch<S>>,
    pub timeout: Duration,
    /// WhenAny only. Informational: recorded on the persisted wait
    /// condition for hosts that want to abort losing work themselves. The
    /// executor stops dispatching branches after a winner and clears the
    /// condition at resolution in either case; no cancellation is sent over
    /// the request bus.
    pub cancel_others: bool,
    pub collect: Option<JoinCollector<S>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForEachOptions {
    /// Maximum concurrent item dispatches. 1 = sequential.
    pub parallelism: usize,
    /// Process (and persist progress) in chunks of this size.
    pub batch_size: Option<usize>,
    /// Persist per item and drop per-item results to bound the working set.
    pub streaming: bool,
    /// Record failing items and proceed instead of stopping on the first
    /// failure.
    pub continue_on_failure: bool,
}

impl Default for ForEachOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            batch_size: None,
            streaming: false,
            continue_on_failure: false,
        }
    }
}

pub struct ForEachStep<S> {
    pub items: ItemSelector<S>,
    pub dispatch: ItemRequestFactory<S>,
    pub options: ForEachOptions,
    pub on_item_success: Option<ItemSuccessHook<S>>,
    pub on_item_fail: Option<ItemFailureHook<S>>,
}

impl<S> Step<S> {
    /// Stable human-readable kind name, used in diagnostics and position
    /// resolution output.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Step::Send(_) => "send",
            Step::Mutate(_) => "mutate",
            Step::If(_) => "if",
            Step::Switch(_) => "switch",
            Step::ForEach(_) => "for-each",
            Step::Loop(l) => match l.kind {
                LoopKind::While(_) => "while",
                LoopKind::DoWhile(_) => "do-while",
                LoopKind::Repeat(_) => "repeat",
            },
            Step::Try(_) => "try",
            Step::Join(j) => match j.kind {
                WaitKind::All => "when-all",
                WaitKind::Any => "when-any",
            },
            Step::BreakIf(_) => "break-if",
            Step::ContinueIf(_) => "continue-if",
        }
    }
}

impl<S> fmt::Debug for Step<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("kind", &self.kind_name())
            .finish_non_exhaustive()
    }
}

/// Resolves a position against a step sequence, returning the chain of step
/// kind names along the path.
///
/// Deterministic and total for any path the executor produced against the
/// same tree. Loop components are iteration numbers and are accepted
/// unconditionally; all other components are bounds-checked.
pub(crate) fn resolve_path<S>(
    steps: &[Step<S>],
    position: &FlowPosition,
) -> Result<Vec<&'static str>, PositionError> {
    let mut chain = Vec::new();
    let mut visited = FlowPosition::root();
    resolve_sequence(steps, position.path(), &mut visited, &mut chain)?;
    Ok(chain)
}

fn resolve_sequence<'t, S>(
    sequence: &'t [Step<S>],
    components: &[usize],
    visited: &mut FlowPosition,
    chain: &mut Vec<&'static str>,
) -> Result<(), PositionError> {
    let [index, rest @ ..] = components else {
        return Ok(());
    };
    visited.push(*index);
    let step = sequence
        .get(*index)
        .ok_or_else(|| PositionError::OutOfBounds {
            index: *index,
            len: sequence.len(),
            at: visited.to_string(),
        })?;
    chain.push(step.kind_name());

    let [child, rest @ ..] = rest else {
        return Ok(());
    };
    visited.push(*child);

    let branch: &'t [Step<S>] = match step {
        Step::If(s) => {
            if *child < s.arms.len() {
                &s.arms[*child].1
            } else if *child == s.arms.len() && s.otherwise.is_some() {
                s.otherwise.as_deref().unwrap_or(&[])
            } else {
                return Err(PositionError::OutOfBounds {
                    index: *child,
                    len: s.arms.len() + usize::from(s.otherwise.is_some()),
                    at: visited.to_string(),
                });
            }
        }
        Step::Switch(s) => {
            if *child < s.cases.len() {
                &s.cases[*child].1
            } else if *child == s.cases.len() && s.default.is_some() {
                s.default.as_deref().unwrap_or(&[])
            } else {
                return Err(PositionError::OutOfBounds {
                    index: *child,
                    len: s.cases.len() + usize::from(s.default.is_some()),
                    at: visited.to_string(),
                });
            }
        }
        // The component under a loop is an iteration number, not a tree
        // choice; descend straight into the body sequence.
        Step::Loop(s) => &s.body,
        Step::Try(s) => {
            if *child == 0 {
                &s.body
            } else if *child <= s.catches.len() {
                &s.catches[*child - 1].handler
            } else if *child == s.catches.len() + 1 && s.finally.is_some() {
                s.finally.as_deref().unwrap_or(&[])
            } else {
                return Err(PositionError::OutOfBounds {
                    index: *child,
                    len: s.catches.len() + 1 + usize::from(s.finally.is_some()),
                    at: visited.to_string(),
                });
            }
        }
        Step::Join(s) => {
            let branch = s
                .branches
                .get(*child)
                .ok_or_else(|| PositionError::OutOfBounds {
                    index: *child,
                    len: s.branches.len(),
                    at: visited.to_string(),
                })?;
            &branch.steps
        }
        other => {
            return Err(PositionError::NotComposite {
                kind: other.kind_name(),
                at: visited.to_string(),
            });
        }
    };

    resolve_sequence(branch, rest, visited, chain)
}
