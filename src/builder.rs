//! Fluent construction of flow definitions.
//!
//! The builder validates structure as it closes scopes and reports the first
//! problem from [`FlowBuilder::build`]; a [`FlowConfig`](crate::flow::FlowConfig)
//! therefore never contains an orphan loop control, an undispatched
//! `ForEach`, or a join with duplicate branch names.
//!
//! Nested scopes (branch bodies, loop bodies, try regions) are configured
//! through closures receiving a fresh [`SequenceBuilder`]:
//!
//! ```ignore
//! let flow = FlowConfig::builder("checkout")
//!     .mutate(|s: &mut Cart| s.attempts += 1)
//!     .decide(|d| {
//!         d.when(|s| s.total > 100.0, |seq| seq.send(request_review))
//!             .otherwise(|seq| seq.send(auto_approve))
//!     })
//!     .build()?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::bus::FlowRequest;
use crate::flow::FlowConfig;
use crate::governors::Governors;
use crate::step::{
    CatchClause, ForEachOptions, ForEachStep, IfStep, JoinBranch, JoinStep, LoopKind, LoopStep,
    SendStep, Step, SwitchStep, TryStep,
};
use crate::wait::WaitKind;

/// Structural problems detected while building a flow.
#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum BuildError {
    #[error("flow '{name}' has no steps")]
    #[diagnostic(code(flowstitch::builder::empty_flow))]
    EmptyFlow { name: String },

    #[error("{kind} used outside of a loop body")]
    #[diagnostic(
        code(flowstitch::builder::orphan_loop_control),
        help("break-if and continue-if only have meaning inside while, do-while, or repeat bodies.")
    )]
    OrphanLoopControl { kind: &'static str },

    #[error("{context} has an empty body")]
    #[diagnostic(code(flowstitch::builder::empty_body))]
    EmptyBody { context: &'static str },

    #[error("for-each step declared without a dispatch")]
    #[diagnostic(
        code(flowstitch::builder::missing_dispatch),
        help("Call .dispatch(..) on the for-each builder to define the per-item request.")
    )]
    MissingDispatch,

    #[error("{kind} declared with no arms")]
    #[diagnostic(code(flowstitch::builder::no_arms))]
    NoArms { kind: &'static str },

    #[error("join step declared with no branches")]
    #[diagnostic(code(flowstitch::builder::no_branches))]
    NoBranches,

    #[error("join step declares branch '{name}' more than once")]
    #[diagnostic(
        code(flowstitch::builder::duplicate_branch),
        help("Branch names are the signal correlation keys; they must be unique within a join.")
    )]
    DuplicateBranch { name: String },
}

/// Builds one step sequence. Obtained from [`FlowBuilder`] or from the
/// closure parameter of a nested scope.
pub struct SequenceBuilder<S> {
    steps: Vec<Step<S>>,
    in_loop: bool,
    errors: Vec<BuildError>,
}

fn build_nested<S>(
    in_loop: bool,
    configure: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
) -> (Vec<Step<S>>, Vec<BuildError>) {
    let built = configure(SequenceBuilder::nested(in_loop));
    (built.steps, built.errors)
}

impl<S> SequenceBuilder<S> {
    fn nested(in_loop: bool) -> Self {
        Self {
            steps: Vec::new(),
            in_loop,
            errors: Vec::new(),
        }
    }

    fn absorb(&mut self, errors: Vec<BuildError>) {
        self.errors.extend(errors);
    }

    /// Appends a pure state mutation.
    pub fn mutate(mut self, f: impl Fn(&mut S) + Send + Sync + 'static) -> Self {
        self.steps.push(Step::Mutate(Arc::new(f)));
        self
    }

    /// Appends a fire-and-forget `Send`; the response is discarded.
    pub fn send(mut self, request: impl Fn(&S) -> FlowRequest + Send + Sync + 'static) -> Self {
        self.steps.push(Step::Send(SendStep {
            request: Arc::new(request),
            project: None,
        }));
        self
    }

    /// Appends a `Send` whose response is folded back into state.
    pub fn send_into(
        mut self,
        request: impl Fn(&S) -> FlowRequest + Send + Sync + 'static,
        project: impl Fn(&mut S, Value) + Send + Sync + 'static,
    ) -> Self {
        self.steps.push(Step::Send(SendStep {
            request: Arc::new(request),
            project: Some(Arc::new(project)),
        }));
        self
    }

    /// Appends an If/ElseIf/Else step.
    pub fn decide(mut self, configure: impl FnOnce(DecideBuilder<S>) -> DecideBuilder<S>) -> Self {
        let built = configure(DecideBuilder::new(self.in_loop));
        self.absorb(built.errors);
        if built.arms.is_empty() {
            self.errors.push(BuildError::NoArms { kind: "if" });
        }
        self.steps.push(Step::If(IfStep {
            arms: built.arms,
            otherwise: built.otherwise,
        }));
        self
    }

    /// Appends a Switch/Case/Default step.
    pub fn switch(
        mut self,
        selector: impl Fn(&S) -> Value + Send + Sync + 'static,
        configure: impl FnOnce(SwitchBuilder<S>) -> SwitchBuilder<S>,
    ) -> Self {
        let built = configure(SwitchBuilder::new(self.in_loop));
        self.absorb(built.errors);
        if built.cases.is_empty() {
            self.errors.push(BuildError::NoArms { kind: "switch" });
        }
        self.steps.push(Step::Switch(SwitchStep {
            selector: Arc::new(selector),
            cases: built.cases,
            default: built.default,
        }));
        self
    }

    /// Appends a pre-checked loop: zero or more iterations.
    pub fn while_loop(
        self,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        self.push_loop(LoopKind::While(Arc::new(predicate)), "while loop", body)
    }

    /// Appends a post-checked loop: at least one iteration.
    pub fn do_while(
        self,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        self.push_loop(LoopKind::DoWhile(Arc::new(predicate)), "do-while loop", body)
    }

    /// Appends a fixed-count loop.
    pub fn repeat(
        self,
        count: usize,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        self.repeat_with(move |_| count, body)
    }

    /// Appends a counted loop whose count is read from state once, at loop
    /// entry.
    pub fn repeat_with(
        self,
        count: impl Fn(&S) -> usize + Send + Sync + 'static,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        self.push_loop(LoopKind::Repeat(Arc::new(count)), "repeat loop", body)
    }

    fn push_loop(
        mut self,
        kind: LoopKind<S>,
        context: &'static str,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        let (steps, errors) = build_nested(true, body);
        self.absorb(errors);
        if steps.is_empty() {
            self.errors.push(BuildError::EmptyBody { context });
        }
        self.steps.push(Step::Loop(LoopStep { kind, body: steps }));
        self
    }

    /// Breaks the innermost loop when the predicate holds. Only valid inside
    /// a loop body.
    pub fn break_if(mut self, predicate: impl Fn(&S) -> bool + Send + Sync + 'static) -> Self {
        if !self.in_loop {
            self.errors
                .push(BuildError::OrphanLoopControl { kind: "break-if" });
        }
        self.steps.push(Step::BreakIf(Arc::new(predicate)));
        self
    }

    /// Skips to the next iteration when the predicate holds. Only valid
    /// inside a loop body.
    pub fn continue_if(mut self, predicate: impl Fn(&S) -> bool + Send + Sync + 'static) -> Self {
        if !self.in_loop {
            self.errors
                .push(BuildError::OrphanLoopControl { kind: "continue-if" });
        }
        self.steps.push(Step::ContinueIf(Arc::new(predicate)));
        self
    }

    /// Appends a collection-processing step with durable per-item progress.
    pub fn for_each(
        mut self,
        items: impl Fn(&S) -> Vec<Value> + Send + Sync + 'static,
        configure: impl FnOnce(ForEachBuilder<S>) -> ForEachBuilder<S>,
    ) -> Self {
        let built = configure(ForEachBuilder::new());
        let Some(dispatch) = built.dispatch else {
            self.errors.push(BuildError::MissingDispatch);
            return self;
        };
        self.steps.push(Step::ForEach(ForEachStep {
            items: Arc::new(items),
            dispatch,
            options: built.options,
            on_item_success: built.on_item_success,
            on_item_fail: built.on_item_fail,
        }));
        self
    }

    /// Appends a Try/Catch/Finally step.
    pub fn attempt(mut self, configure: impl FnOnce(TryBuilder<S>) -> TryBuilder<S>) -> Self {
        let built = configure(TryBuilder::new(self.in_loop));
        self.absorb(built.errors);
        if built.body.is_empty() {
            self.errors.push(BuildError::EmptyBody { context: "try" });
        }
        self.steps.push(Step::Try(TryStep {
            body: built.body,
            catches: built.catches,
            finally: built.finally,
        }));
        self
    }

    /// Appends a fork-join resolved when every branch completes.
    pub fn when_all(self, configure: impl FnOnce(JoinBuilder<S>) -> JoinBuilder<S>) -> Self {
        self.push_join(WaitKind::All, configure)
    }

    /// Appends a fork-join resolved by the first branch to complete.
    pub fn when_any(self, configure: impl FnOnce(JoinBuilder<S>) -> JoinBuilder<S>) -> Self {
        self.push_join(WaitKind::Any, configure)
    }

    fn push_join(
        mut self,
        kind: WaitKind,
        configure: impl FnOnce(JoinBuilder<S>) -> JoinBuilder<S>,
    ) -> Self {
        let built = configure(JoinBuilder::new());
        self.absorb(built.errors);
        if built.branches.is_empty() {
            self.errors.push(BuildError::NoBranches);
        }
        for (i, branch) in built.branches.iter().enumerate() {
            if built.branches[..i].iter().any(|b| b.name == branch.name) {
                self.errors.push(BuildError::DuplicateBranch {
                    name: branch.name.clone(),
                });
            }
        }
        self.steps.push(Step::Join(JoinStep {
            kind,
            branches: built.branches,
            timeout: built.timeout,
            cancel_others: built.cancel_others,
            collect: built.collect,
        }));
        self
    }
}

/// Entry point for defining a flow. Created via
/// [`FlowConfig::builder`](crate::flow::FlowConfig::builder).
pub struct FlowBuilder<S> {
    name: String,
    root: SequenceBuilder<S>,
    governors: Governors,
}

impl<S> FlowBuilder<S> {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: SequenceBuilder::nested(false),
            governors: Governors::default(),
        }
    }

    /// Overrides the default execution limits for flows built from this
    /// definition.
    pub fn with_governors(mut self, governors: Governors) -> Self {
        self.governors = governors;
        self
    }

    pub fn mutate(mut self, f: impl Fn(&mut S) + Send + Sync + 'static) -> Self {
        self.root = self.root.mutate(f);
        self
    }

    pub fn send(mut self, request: impl Fn(&S) -> FlowRequest + Send + Sync + 'static) -> Self {
        self.root = self.root.send(request);
        self
    }

    pub fn send_into(
        mut self,
        request: impl Fn(&S) -> FlowRequest + Send + Sync + 'static,
        project: impl Fn(&mut S, Value) + Send + Sync + 'static,
    ) -> Self {
        self.root = self.root.send_into(request, project);
        self
    }

    pub fn decide(mut self, configure: impl FnOnce(DecideBuilder<S>) -> DecideBuilder<S>) -> Self {
        self.root = self.root.decide(configure);
        self
    }

    pub fn switch(
        mut self,
        selector: impl Fn(&S) -> Value + Send + Sync + 'static,
        configure: impl FnOnce(SwitchBuilder<S>) -> SwitchBuilder<S>,
    ) -> Self {
        self.root = self.root.switch(selector, configure);
        self
    }

    pub fn while_loop(
        mut self,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        self.root = self.root.while_loop(predicate, body);
        self
    }

    pub fn do_while(
        mut self,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        self.root = self.root.do_while(predicate, body);
        self
    }

    pub fn repeat(
        mut self,
        count: usize,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        self.root = self.root.repeat(count, body);
        self
    }

    pub fn repeat_with(
        mut self,
        count: impl Fn(&S) -> usize + Send + Sync + 'static,
        body: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        self.root = self.root.repeat_with(count, body);
        self
    }

    pub fn for_each(
        mut self,
        items: impl Fn(&S) -> Vec<Value> + Send + Sync + 'static,
        configure: impl FnOnce(ForEachBuilder<S>) -> ForEachBuilder<S>,
    ) -> Self {
        self.root = self.root.for_each(items, configure);
        self
    }

    pub fn attempt(mut self, configure: impl FnOnce(TryBuilder<S>) -> TryBuilder<S>) -> Self {
        self.root = self.root.attempt(configure);
        self
    }

    pub fn when_all(mut self, configure: impl FnOnce(JoinBuilder<S>) -> JoinBuilder<S>) -> Self {
        self.root = self.root.when_all(configure);
        self
    }

    pub fn when_any(mut self, configure: impl FnOnce(JoinBuilder<S>) -> JoinBuilder<S>) -> Self {
        self.root = self.root.when_any(configure);
        self
    }

    /// Finalizes the definition, reporting the first structural problem
    /// found.
    pub fn build(mut self) -> Result<FlowConfig<S>, BuildError> {
        if self.root.steps.is_empty() {
            self.root.errors.push(BuildError::EmptyFlow {
                name: self.name.clone(),
            });
        }
        if let Some(error) = self.root.errors.into_iter().next() {
            return Err(error);
        }
        Ok(FlowConfig::new(self.name, self.root.steps, self.governors))
    }
}

/// Configures the arms of an If/ElseIf/Else step.
pub struct DecideBuilder<S> {
    arms: Vec<(crate::step::Predicate<S>, Vec<Step<S>>)>,
    otherwise: Option<Vec<Step<S>>>,
    in_loop: bool,
    errors: Vec<BuildError>,
}

impl<S> DecideBuilder<S> {
    fn new(in_loop: bool) -> Self {
        Self {
            arms: Vec::new(),
            otherwise: None,
            in_loop,
            errors: Vec::new(),
        }
    }

    /// Adds a predicate arm. Arms are evaluated in declaration order; the
    /// first match wins.
    pub fn when(
        mut self,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        branch: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        let (steps, errors) = build_nested(self.in_loop, branch);
        self.errors.extend(errors);
        self.arms.push((Arc::new(predicate), steps));
        self
    }

    /// Sets the Else branch, taken when no arm matches.
    pub fn otherwise(
        mut self,
        branch: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        let (steps, errors) = build_nested(self.in_loop, branch);
        self.errors.extend(errors);
        self.otherwise = Some(steps);
        self
    }
}

/// Configures the cases of a Switch/Case/Default step.
pub struct SwitchBuilder<S> {
    cases: Vec<(Value, Vec<Step<S>>)>,
    default: Option<Vec<Step<S>>>,
    in_loop: bool,
    errors: Vec<BuildError>,
}

impl<S> SwitchBuilder<S> {
    fn new(in_loop: bool) -> Self {
        Self {
            cases: Vec::new(),
            default: None,
            in_loop,
            errors: Vec::new(),
        }
    }

    /// Adds a case matched when the selector value equals `value`.
    pub fn case(
        mut self,
        value: impl Into<Value>,
        branch: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        let (steps, errors) = build_nested(self.in_loop, branch);
        self.errors.extend(errors);
        self.cases.push((value.into(), steps));
        self
    }

    /// Sets the Default branch, taken when no case matches.
    pub fn fallback(
        mut self,
        branch: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        let (steps, errors) = build_nested(self.in_loop, branch);
        self.errors.extend(errors);
        self.default = Some(steps);
        self
    }
}

/// Configures a Try/Catch/Finally step.
pub struct TryBuilder<S> {
    body: Vec<Step<S>>,
    catches: Vec<CatchClause<S>>,
    finally: Option<Vec<Step<S>>>,
    in_loop: bool,
    errors: Vec<BuildError>,
}

impl<S> TryBuilder<S> {
    fn new(in_loop: bool) -> Self {
        Self {
            body: Vec::new(),
            catches: Vec::new(),
            finally: None,
            in_loop,
            errors: Vec::new(),
        }
    }

    /// The protected region.
    pub fn body(mut self, steps: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>) -> Self {
        let (built, errors) = build_nested(self.in_loop, steps);
        self.errors.extend(errors);
        self.body = built;
        self
    }

    /// Adds a catch clause matching one failure kind. Clauses are tried in
    /// declaration order.
    pub fn catch(
        mut self,
        kind: impl Into<String>,
        handler: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        let (steps, errors) = build_nested(self.in_loop, handler);
        self.errors.extend(errors);
        self.catches.push(CatchClause {
            kind: Some(kind.into()),
            handler: steps,
        });
        self
    }

    /// Adds a catch-all clause matching any non-fatal failure.
    pub fn catch_all(
        mut self,
        handler: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        let (steps, errors) = build_nested(self.in_loop, handler);
        self.errors.extend(errors);
        self.catches.push(CatchClause {
            kind: None,
            handler: steps,
        });
        self
    }

    /// The region that runs on every exit path.
    pub fn finally(
        mut self,
        steps: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>,
    ) -> Self {
        let (built, errors) = build_nested(self.in_loop, steps);
        self.errors.extend(errors);
        self.finally = Some(built);
        self
    }
}

/// Configures a WhenAll/WhenAny join step.
pub struct JoinBuilder<S> {
    branches: Vec<JoinBranch<S>>,
    timeout: Duration,
    cancel_others: bool,
    collect: Option<crate::step::JoinCollector<S>>,
    errors: Vec<BuildError>,
}

impl<S> JoinBuilder<S> {
    fn new() -> Self {
        Self {
            branches: Vec::new(),
            // Joins wait on the outside world; the default is deliberately
            // longer than the per-leg execution timeout.
            timeout: Duration::from_secs(3600),
            cancel_others: false,
            collect: None,
            errors: Vec::new(),
        }
    }

    /// Adds a named branch. The name is the correlation key external
    /// signals use.
    pub fn branch(
        mut self,
        name: impl Into<String>,
        configure: impl FnOnce(BranchBuilder<S>) -> BranchBuilder<S>,
    ) -> Self {
        let built = configure(BranchBuilder::new(name.into()));
        self.errors.extend(built.errors);
        if built.branch.steps.is_empty() && !built.branch.awaits_signal {
            self.errors.push(BuildError::EmptyBody {
                context: "join branch",
            });
        }
        self.branches.push(built.branch);
        self
    }

    /// How long the durable wait condition may stay unresolved before
    /// `timed_out_waits` reports it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// WhenAny only: marks losing branches as cancellable. The flag is
    /// recorded on the persisted wait condition for hosts to act on; the
    /// executor itself never dispatches branches after the winner and
    /// treats late sibling signals as benign either way.
    pub fn cancel_others(mut self) -> Self {
        self.cancel_others = true;
        self
    }

    /// Folds the resolved branch signals back into state.
    pub fn collect(mut self, f: impl Fn(&mut S, &[crate::wait::BranchSignal]) + Send + Sync + 'static) -> Self {
        self.collect = Some(Arc::new(f));
        self
    }
}

/// Configures one branch of a join.
pub struct BranchBuilder<S> {
    branch: JoinBranch<S>,
    errors: Vec<BuildError>,
}

impl<S> BranchBuilder<S> {
    fn new(name: String) -> Self {
        Self {
            branch: JoinBranch {
                name,
                steps: Vec::new(),
                awaits_signal: false,
                yields: None,
            },
            errors: Vec::new(),
        }
    }

    /// The branch body. Loop controls from an enclosing loop do not cross
    /// into a branch; its sequence starts outside any loop.
    pub fn steps(mut self, steps: impl FnOnce(SequenceBuilder<S>) -> SequenceBuilder<S>) -> Self {
        let (built, errors) = build_nested(false, steps);
        self.errors.extend(errors);
        self.branch.steps = built;
        self
    }

    /// Marks the branch as completed only by an external signal, never by
    /// the executor itself.
    pub fn awaits_signal(mut self) -> Self {
        self.branch.awaits_signal = true;
        self
    }

    /// Completion value reported when the executor self-completes the
    /// branch. Defaults to `null`.
    pub fn yields(mut self, f: impl Fn(&S) -> Value + Send + Sync + 'static) -> Self {
        self.branch.yields = Some(Arc::new(f));
        self
    }
}

/// Configures a `ForEach` step.
pub struct ForEachBuilder<S> {
    dispatch: Option<crate::step::ItemRequestFactory<S>>,
    options: ForEachOptions,
    on_item_success: Option<crate::step::ItemSuccessHook<S>>,
    on_item_fail: Option<crate::step::ItemFailureHook<S>>,
}

impl<S> ForEachBuilder<S> {
    fn new() -> Self {
        Self {
            dispatch: None,
            options: ForEachOptions::default(),
            on_item_success: None,
            on_item_fail: None,
        }
    }

    /// The per-item request. Required.
    pub fn dispatch(
        mut self,
        f: impl Fn(&S, &Value) -> FlowRequest + Send + Sync + 'static,
    ) -> Self {
        self.dispatch = Some(Arc::new(f));
        self
    }

    /// Maximum concurrent item dispatches. Values below 1 are treated as 1.
    pub fn parallelism(mut self, n: usize) -> Self {
        self.options.parallelism = n.max(1);
        self
    }

    /// Process and persist progress in chunks of `n` items.
    pub fn batch_size(mut self, n: usize) -> Self {
        self.options.batch_size = Some(n.max(1));
        self
    }

    /// Persist after every item and drop per-item results from the durable
    /// progress record.
    pub fn streaming(mut self) -> Self {
        self.options.streaming = true;
        self
    }

    /// Record failing items and keep going instead of stopping at the first
    /// failure.
    pub fn continue_on_failure(mut self) -> Self {
        self.options.continue_on_failure = true;
        self
    }

    /// Hook invoked with `(state, item, response)` after each successful
    /// item.
    pub fn on_item_success(
        mut self,
        f: impl Fn(&mut S, &Value, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.on_item_success = Some(Arc::new(f));
        self
    }

    /// Hook invoked with `(state, item, error message)` after each failed
    /// item.
    pub fn on_item_fail(
        mut self,
        f: impl Fn(&mut S, &Value, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_item_fail = Some(Arc::new(f));
        self
    }
}
