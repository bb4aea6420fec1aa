//! The step-tree interpreter behind [`FlowExecutor`](super::FlowExecutor).
//!
//! One `Interp` value lives for one execution leg. It owns the deserialized
//! state, walks the tree recursively, and maintains `position` as the exact
//! path to the step being executed. Resumption follows the stored cursor
//! component by component: earlier siblings are skipped, branch choices are
//! replayed rather than re-evaluated, and interpretation goes live again at
//! the node the cursor ends on. That node is always one that re-enters
//! idempotently (a join re-checks its wait condition, a for-each reloads its
//! progress record).

use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::Value;

use crate::bus::{BusError, FlowRequest, RequestBus};
use crate::governors::Governors;
use crate::position::{FlowPosition, PositionError};
use crate::progress::ForEachProgress;
use crate::snapshot::{FlowSnapshot, FlowStatus, PendingFailure, SnapshotError};
use crate::step::{
    ForEachStep, IfStep, JoinStep, LoopKind, LoopStep, SendStep, Step, SwitchStep, TryStep,
};
use crate::store::{SnapshotStore, StoreError};
use crate::wait::{BranchSignal, WaitCondition, WaitKind};

use super::{FlowError, FlowFailure, FlowResult, WaitHandle};

/// Control signal threaded up through the tree walk.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Continue with the next sibling step.
    Next,
    /// Unwind to the innermost loop and exit it.
    Break,
    /// Unwind to the innermost loop and start its next iteration.
    Continue,
    /// Stop the leg; a snapshot was already persisted at the wait point.
    Suspend,
}

/// A failure raised by a step.
#[derive(Debug)]
pub(crate) struct StepFailure {
    pub kind: String,
    pub message: String,
    /// Fatal failures bypass `Catch` clauses (governor trips, corrupted
    /// cursors). `Finally` regions still run for them.
    pub fatal: bool,
    pub at: FlowPosition,
}

/// Why interpretation stopped early.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// Domain failure, subject to Try/Catch handling.
    Failure(StepFailure),
    /// Infrastructure failure (store, serialization); aborts the leg.
    Infra(FlowError),
}

impl From<StoreError> for Interrupt {
    fn from(source: StoreError) -> Self {
        Interrupt::Infra(FlowError::Store(source))
    }
}

impl From<SnapshotError> for Interrupt {
    fn from(source: SnapshotError) -> Self {
        Interrupt::Infra(FlowError::Snapshot(source))
    }
}

pub(crate) struct Interp<'a, S> {
    bus: &'a dyn RequestBus,
    store: &'a dyn SnapshotStore,
    flow_id: &'a str,
    state: S,
    position: FlowPosition,
    /// Stored resume target; empty for a fresh run.
    cursor: Vec<usize>,
    /// True while still descending along `cursor`.
    resuming: bool,
    version: u64,
    created_at: DateTime<Utc>,
    governors: Governors,
    deadline: Instant,
    iterations: u64,
    suspend: Option<WaitHandle>,
    /// A failure held back while its `Finally` region is suspended; rethrown
    /// once the finally completes.
    pending_failure: Option<PendingFailure>,
}

impl<'a, S> Interp<'a, S>
where
    S: Serialize + Send + Sync,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        governors: Governors,
        bus: &'a dyn RequestBus,
        store: &'a dyn SnapshotStore,
        flow_id: &'a str,
        state: S,
        version: u64,
        created_at: DateTime<Utc>,
        cursor: Vec<usize>,
        pending_failure: Option<PendingFailure>,
    ) -> Self {
        Self {
            bus,
            store,
            flow_id,
            state,
            position: FlowPosition::root(),
            resuming: !cursor.is_empty(),
            cursor,
            version,
            created_at,
            governors,
            deadline: Instant::now() + governors.timeout,
            iterations: 0,
            suspend: None,
            pending_failure,
        }
    }

    /// Converts the leg outcome into a [`FlowResult`], persisting the
    /// terminal snapshot.
    pub(crate) async fn finish(
        mut self,
        outcome: Result<Flow, Interrupt>,
    ) -> Result<FlowResult<S>, FlowError> {
        match outcome {
            Ok(Flow::Suspend) => {
                let wait = self.suspend.take();
                tracing::info!(flow_id = %self.flow_id, "flow suspended");
                Ok(FlowResult {
                    flow_id: self.flow_id.to_string(),
                    status: FlowStatus::Suspended,
                    state: self.state,
                    error: None,
                    wait,
                })
            }
            Ok(_) => {
                self.pending_failure = None;
                self.persist(FlowStatus::Completed, FlowPosition::root(), None)
                    .await?;
                tracing::info!(flow_id = %self.flow_id, "flow completed");
                Ok(FlowResult {
                    flow_id: self.flow_id.to_string(),
                    status: FlowStatus::Completed,
                    state: self.state,
                    error: None,
                    wait: None,
                })
            }
            Err(Interrupt::Failure(failure)) => {
                self.pending_failure = None;
                self.persist(FlowStatus::Failed, failure.at.clone(), None)
                    .await?;
                tracing::warn!(
                    flow_id = %self.flow_id,
                    kind = %failure.kind,
                    at = %failure.at,
                    "flow failed: {}",
                    failure.message
                );
                Ok(FlowResult {
                    flow_id: self.flow_id.to_string(),
                    status: FlowStatus::Failed,
                    state: self.state,
                    error: Some(FlowFailure {
                        kind: failure.kind,
                        message: failure.message,
                        position: failure.at,
                    }),
                    wait: None,
                })
            }
            Err(Interrupt::Infra(error)) => Err(error),
        }
    }

    /// The next cursor component at the current depth, while resuming.
    fn resume_component(&self) -> Option<usize> {
        if self.resuming {
            self.cursor.get(self.position.depth()).copied()
        } else {
            None
        }
    }

    fn failure(&self, kind: impl Into<String>, message: impl Into<String>) -> Interrupt {
        Interrupt::Failure(StepFailure {
            kind: kind.into(),
            message: message.into(),
            fatal: false,
            at: self.position.clone(),
        })
    }

    fn governor_trip(&self, kind: &'static str, message: String) -> Interrupt {
        Interrupt::Failure(StepFailure {
            kind: kind.to_string(),
            message,
            fatal: true,
            at: self.position.clone(),
        })
    }

    fn check_depth(&self) -> Result<(), Interrupt> {
        if self.position.depth() > self.governors.max_depth {
            return Err(self.governor_trip(
                "governor-depth",
                format!(
                    "maximum nesting depth {} exceeded at {}",
                    self.governors.max_depth, self.position
                ),
            ));
        }
        Ok(())
    }

    fn check_timeout(&self) -> Result<(), Interrupt> {
        if Instant::now() >= self.deadline {
            return Err(self.governor_trip(
                "governor-timeout",
                format!(
                    "execution timeout of {:?} exceeded at {}",
                    self.governors.timeout, self.position
                ),
            ));
        }
        Ok(())
    }

    fn bump_iterations(&mut self) -> Result<(), Interrupt> {
        self.iterations += 1;
        if self.iterations > self.governors.max_iterations {
            return Err(self.governor_trip(
                "governor-iterations",
                format!(
                    "iteration limit {} exceeded at {}",
                    self.governors.max_iterations, self.position
                ),
            ));
        }
        Ok(())
    }

    async fn persist(
        &mut self,
        status: FlowStatus,
        position: FlowPosition,
        wait: Option<String>,
    ) -> Result<(), FlowError> {
        let snapshot = FlowSnapshot {
            flow_id: self.flow_id.to_string(),
            state: serde_json::to_value(&self.state).map_err(SnapshotError::from)?,
            position,
            status,
            version: self.version,
            created_at: self.created_at,
            updated_at: Utc::now(),
            wait,
            pending_failure: self.pending_failure.clone(),
        };
        if !self.store.update(&snapshot).await? {
            return Err(FlowError::SnapshotConflict {
                flow_id: self.flow_id.to_string(),
            });
        }
        self.version += 1;
        Ok(())
    }

    pub(crate) fn run_sequence(
        &mut self,
        steps: &'a [Step<S>],
    ) -> BoxFuture<'_, Result<Flow, Interrupt>> {
        Box::pin(async move {
            self.check_depth()?;
            let mut index = self.resume_component().unwrap_or(0);
            while index < steps.len() {
                self.check_timeout()?;
                self.position.push(index);
                if self.resuming && self.position.path() == self.cursor.as_slice() {
                    // Arrived at the stored node; interpretation is live
                    // again from here.
                    self.resuming = false;
                }
                let flow = self.run_step(&steps[index]).await;
                self.position.pop();
                match flow? {
                    Flow::Next => {}
                    other => return Ok(other),
                }
                index += 1;
            }
            Ok(Flow::Next)
        })
    }

    async fn run_step(&mut self, step: &'a Step<S>) -> Result<Flow, Interrupt> {
        match step {
            Step::Mutate(mutation) => {
                mutation(&mut self.state);
                Ok(Flow::Next)
            }
            Step::Send(send) => self.run_send(send).await,
            Step::If(s) => self.run_if(s).await,
            Step::Switch(s) => self.run_switch(s).await,
            Step::Loop(s) => self.run_loop(s).await,
            Step::Try(s) => self.run_try(s).await,
            Step::Join(s) => self.run_join(s).await,
            Step::ForEach(s) => self.run_foreach(s).await,
            Step::BreakIf(predicate) => {
                if predicate(&self.state) {
                    Ok(Flow::Break)
                } else {
                    Ok(Flow::Next)
                }
            }
            Step::ContinueIf(predicate) => {
                if predicate(&self.state) {
                    Ok(Flow::Continue)
                } else {
                    Ok(Flow::Next)
                }
            }
        }
    }

    async fn run_send(&mut self, step: &'a SendStep<S>) -> Result<Flow, Interrupt> {
        let request = (step.request)(&self.state);
        tracing::debug!(kind = %request.kind, at = %self.position, "dispatching request");
        match self.bus.dispatch(request).await {
            Ok(response) => {
                if let Some(project) = &step.project {
                    project(&mut self.state, response);
                }
                Ok(Flow::Next)
            }
            Err(error) => Err(self.failure(error.kind(), error.to_string())),
        }
    }

    async fn run_if(&mut self, step: &'a IfStep<S>) -> Result<Flow, Interrupt> {
        // A replayed cursor reuses the recorded arm; predicates are not
        // re-evaluated against restored state.
        let choice = match self.resume_component() {
            Some(choice) => choice,
            None => match step.arms.iter().position(|(p, _)| p(&self.state)) {
                Some(arm) => arm,
                None if step.otherwise.is_some() => step.arms.len(),
                None => return Ok(Flow::Next),
            },
        };
        let branch: &'a [Step<S>] = if choice < step.arms.len() {
            &step.arms[choice].1
        } else {
            step.otherwise.as_deref().unwrap_or(&[])
        };
        self.position.push(choice);
        let flow = self.run_sequence(branch).await;
        self.position.pop();
        flow
    }

    async fn run_switch(&mut self, step: &'a SwitchStep<S>) -> Result<Flow, Interrupt> {
        let choice = match self.resume_component() {
            Some(choice) => choice,
            None => {
                let value = (step.selector)(&self.state);
                match step.cases.iter().position(|(v, _)| *v == value) {
                    Some(case) => case,
                    None if step.default.is_some() => step.cases.len(),
                    None => return Ok(Flow::Next),
                }
            }
        };
        let branch: &'a [Step<S>] = if choice < step.cases.len() {
            &step.cases[choice].1
        } else {
            step.default.as_deref().unwrap_or(&[])
        };
        self.position.push(choice);
        let flow = self.run_sequence(branch).await;
        self.position.pop();
        flow
    }

    async fn run_loop(&mut self, step: &'a LoopStep<S>) -> Result<Flow, Interrupt> {
        let mut iteration = 0;
        let mut resumed_mid_iteration = false;
        if let Some(k) = self.resume_component() {
            // The condition held when iteration k started; do not re-check
            // it for the resumed iteration.
            iteration = k;
            resumed_mid_iteration = true;
        }
        // Counted loops read their total once, at entry. Callback purity
        // makes this stable across a resume.
        let total = match &step.kind {
            LoopKind::Repeat(count) => Some(count(&self.state)),
            _ => None,
        };
        loop {
            match &step.kind {
                LoopKind::While(predicate) => {
                    if !resumed_mid_iteration && !predicate(&self.state) {
                        break;
                    }
                }
                LoopKind::DoWhile(_) => {}
                LoopKind::Repeat(_) => {
                    if iteration >= total.unwrap_or(0) {
                        break;
                    }
                }
            }
            resumed_mid_iteration = false;
            self.bump_iterations()?;
            self.check_timeout()?;

            self.position.push(iteration);
            let flow = self.run_sequence(&step.body).await;
            self.position.pop();
            match flow? {
                Flow::Next | Flow::Continue => {}
                Flow::Break => break,
                Flow::Suspend => return Ok(Flow::Suspend),
            }

            if let LoopKind::DoWhile(predicate) = &step.kind {
                if !predicate(&self.state) {
                    break;
                }
            }
            iteration += 1;
        }
        Ok(Flow::Next)
    }

    async fn run_try(&mut self, step: &'a TryStep<S>) -> Result<Flow, Interrupt> {
        let finally_region = step.catches.len() + 1;
        let resume_region = self.resume_component();

        // Resuming inside the finally region: everything before it already
        // ran. A failure recorded before the suspension belongs to this try
        // when it occurred underneath it; rethrow it once the finally
        // completes.
        if resume_region == Some(finally_region) {
            let deferred = self
                .pending_failure
                .as_ref()
                .is_some_and(|p| p.position.path().starts_with(self.position.path()));
            self.position.push(finally_region);
            let flow = self.run_sequence(step.finally.as_deref().unwrap_or(&[])).await;
            self.position.pop();
            return match flow? {
                Flow::Suspend => Ok(Flow::Suspend),
                other => {
                    if deferred {
                        if let Some(p) = self.pending_failure.take() {
                            return Err(Interrupt::Failure(StepFailure {
                                kind: p.kind,
                                message: p.message,
                                fatal: p.fatal,
                                at: p.position,
                            }));
                        }
                    }
                    Ok(other)
                }
            };
        }

        let outcome = match resume_region {
            // Resuming inside a catch handler: the body already failed and
            // matched this clause before the suspension.
            Some(region) if region >= 1 && region < finally_region => {
                self.position.push(region);
                let flow = self
                    .run_sequence(&step.catches[region - 1].handler)
                    .await;
                self.position.pop();
                flow
            }
            _ => {
                self.position.push(0);
                let body = self.run_sequence(&step.body).await;
                self.position.pop();
                match body {
                    Err(Interrupt::Failure(failure)) if !failure.fatal => {
                        match step.catches.iter().position(|c| c.matches(&failure.kind)) {
                            Some(clause) => {
                                tracing::debug!(
                                    kind = %failure.kind,
                                    clause,
                                    "failure caught"
                                );
                                self.position.push(clause + 1);
                                let flow =
                                    self.run_sequence(&step.catches[clause].handler).await;
                                self.position.pop();
                                flow
                            }
                            None => Err(Interrupt::Failure(failure)),
                        }
                    }
                    other => other,
                }
            }
        };

        // Finally runs on every exit path, fatal failures included. A
        // suspension is a pause, not an exit; infrastructure errors abort
        // outright.
        let skip_finally = matches!(outcome, Ok(Flow::Suspend) | Err(Interrupt::Infra(_)));
        if skip_finally {
            return outcome;
        }
        if let Some(finally) = &step.finally {
            // Should the finally suspend, the in-flight failure must survive
            // the restart to be rethrown afterwards.
            if let Err(Interrupt::Failure(failure)) = &outcome {
                self.pending_failure = Some(PendingFailure {
                    kind: failure.kind.clone(),
                    message: failure.message.clone(),
                    fatal: failure.fatal,
                    position: failure.at.clone(),
                });
            }
            self.position.push(finally_region);
            let fin = self.run_sequence(finally).await;
            self.position.pop();
            match fin {
                Ok(Flow::Next) => {}
                Ok(Flow::Suspend) => return Ok(Flow::Suspend),
                // A finally outcome only overrides a clean body outcome;
                // an in-flight failure keeps precedence.
                Ok(other) => {
                    if matches!(outcome, Ok(Flow::Next)) {
                        return Ok(other);
                    }
                }
                Err(error) => {
                    if !matches!(outcome, Err(_)) {
                        return Err(error);
                    }
                }
            }
            self.pending_failure = None;
        }
        outcome
    }

    async fn run_join(&mut self, step: &'a JoinStep<S>) -> Result<Flow, Interrupt> {
        let correlation_id = format!("{}@{}", self.flow_id, self.position);

        match self.store.wait_condition(&correlation_id).await? {
            None => self.enter_join(step, &correlation_id).await?,
            Some(_) => {
                // Re-entry: branches were already dispatched. A deeper
                // cursor means the suspension happened inside one branch;
                // run its remainder before re-checking resolution.
                if let Some(index) = self.resume_component() {
                    match self.resume_join_branch(step, &correlation_id, index).await? {
                        Flow::Next => {}
                        other => return Ok(other),
                    }
                }
            }
        }

        let condition = self
            .store
            .wait_condition(&correlation_id)
            .await?
            .ok_or_else(|| StoreError::UnknownWait {
                correlation_id: correlation_id.clone(),
            })?;

        if condition.is_resolved() {
            return self.resolve_join(step, &correlation_id, condition).await;
        }

        if condition.timed_out_at(Utc::now()) {
            self.store.clear_wait_condition(&correlation_id).await?;
            return Err(self.failure(
                "wait-timeout",
                format!(
                    "wait condition '{}' timed out after {:?}",
                    correlation_id, condition.timeout
                ),
            ));
        }

        // Park the flow. The snapshot points at this join so a resume
        // re-enters here and re-checks the condition.
        self.persist(
            FlowStatus::Suspended,
            self.position.clone(),
            Some(correlation_id.clone()),
        )
        .await
        .map_err(Interrupt::Infra)?;
        self.suspend = Some(WaitHandle {
            correlation_id,
            expected: condition.expected,
            completed: condition.completed(),
        });
        Ok(Flow::Suspend)
    }

    /// First entry: registers the wait condition, then dispatches branches
    /// sequentially in declaration order against live state.
    async fn enter_join(
        &mut self,
        step: &'a JoinStep<S>,
        correlation_id: &str,
    ) -> Result<(), Interrupt> {
        let branch_ids = step.branches.iter().map(|b| b.name.clone()).collect();
        let condition = WaitCondition::new(
            correlation_id,
            self.flow_id,
            self.position.clone(),
            step.kind,
            branch_ids,
            step.timeout,
            step.cancel_others,
        );
        self.store.set_wait_condition(&condition).await?;
        tracing::debug!(
            correlation_id,
            branches = step.branches.len(),
            "wait condition registered"
        );

        for (index, branch) in step.branches.iter().enumerate() {
            self.position.push(index);
            let flow = self.run_sequence(&branch.steps).await;
            self.position.pop();
            let update = match flow {
                Ok(Flow::Suspend) => return Err(Interrupt::Failure(StepFailure {
                    kind: "nested-wait".to_string(),
                    message: format!(
                        "branch '{}' suspended while its join was still dispatching",
                        branch.name
                    ),
                    fatal: true,
                    at: self.position.clone(),
                })),
                Ok(_) => {
                    if branch.awaits_signal {
                        // Completed only by an external signal.
                        continue;
                    }
                    let value = branch
                        .yields
                        .as_ref()
                        .map(|y| y(&self.state))
                        .unwrap_or(Value::Null);
                    self.store
                        .update_wait_condition(
                            correlation_id,
                            BranchSignal::ok(&branch.name, value),
                        )
                        .await?
                }
                Err(Interrupt::Failure(failure)) if !failure.fatal => {
                    self.store
                        .update_wait_condition(
                            correlation_id,
                            BranchSignal::failed(&branch.name, failure.message),
                        )
                        .await?
                }
                Err(other) => return Err(other),
            };
            // The first completion settles a when-any; later branches are
            // not dispatched.
            if update.is_complete && step.kind == WaitKind::Any {
                break;
            }
        }
        Ok(())
    }

    async fn resume_join_branch(
        &mut self,
        step: &'a JoinStep<S>,
        correlation_id: &str,
        index: usize,
    ) -> Result<Flow, Interrupt> {
        let branch = step
            .branches
            .get(index)
            .ok_or_else(|| {
                Interrupt::Infra(FlowError::CorruptPosition {
                    source: PositionError::OutOfBounds {
                        index,
                        len: step.branches.len(),
                        at: self.position.to_string(),
                    },
                })
            })?;
        self.position.push(index);
        let flow = self.run_sequence(&branch.steps).await;
        self.position.pop();
        match flow? {
            Flow::Suspend => return Ok(Flow::Suspend),
            _ => {}
        }
        if !branch.awaits_signal {
            let value = branch
                .yields
                .as_ref()
                .map(|y| y(&self.state))
                .unwrap_or(Value::Null);
            self.store
                .update_wait_condition(correlation_id, BranchSignal::ok(&branch.name, value))
                .await?;
        }
        Ok(Flow::Next)
    }

    async fn resolve_join(
        &mut self,
        step: &'a JoinStep<S>,
        correlation_id: &str,
        condition: WaitCondition,
    ) -> Result<Flow, Interrupt> {
        // Under when-any only the winner decides the outcome; under
        // when-all every branch must have succeeded.
        let decisive: &[BranchSignal] = match step.kind {
            WaitKind::All => &condition.results,
            WaitKind::Any => match condition.winner() {
                Some(winner) => std::slice::from_ref(winner),
                None => &[],
            },
        };
        if let Some(failed) = decisive.iter().find(|s| !s.success) {
            let failure = self.failure(
                "branch-failed",
                format!(
                    "branch '{}' of wait condition '{}' failed: {}",
                    failed.branch_id, correlation_id, failed.value
                ),
            );
            self.store.clear_wait_condition(correlation_id).await?;
            return Err(failure);
        }
        if let Some(collect) = &step.collect {
            collect(&mut self.state, &condition.results);
        }
        self.store.clear_wait_condition(correlation_id).await?;
        tracing::debug!(correlation_id, results = condition.results.len(), "join resolved");
        Ok(Flow::Next)
    }

    async fn run_foreach(&mut self, step: &'a ForEachStep<S>) -> Result<Flow, Interrupt> {
        let items = (step.items)(&self.state);
        let key = self.position.to_string();
        let mut progress = match self.store.foreach_progress(self.flow_id, &key).await? {
            Some(progress) => progress,
            None => {
                let progress = ForEachProgress::new(self.flow_id, &key, items.len());
                self.store.save_foreach_progress(&progress).await?;
                // Anchor the snapshot here so an interruption resumes at
                // this node with the progress record intact.
                self.persist(FlowStatus::Running, self.position.clone(), None)
                    .await
                    .map_err(Interrupt::Infra)?;
                progress
            }
        };

        let options = &step.options;
        // Batch size bounds how much work happens between persists;
        // parallelism bounds how many dispatches are in flight at once. The
        // two compose: each batch is dispatched in waves of at most
        // `parallelism` concurrent requests.
        let concurrency = options.parallelism.max(1);
        let batch_size = options.batch_size.unwrap_or(concurrency);
        let remaining: Vec<usize> = progress.remaining().collect();
        tracing::debug!(
            at = %key,
            total = items.len(),
            remaining = remaining.len(),
            "processing collection"
        );

        for batch in remaining.chunks(batch_size) {
            self.check_timeout()?;
            let mut outcomes: Vec<(usize, Result<Value, BusError>)> =
                Vec::with_capacity(batch.len());

            if concurrency > 1 {
                // Requests are built serially against current state, then
                // dispatched concurrently; write-back below is serial again.
                for wave in batch.chunks(concurrency) {
                    let requests: Vec<(usize, FlowRequest)> = wave
                        .iter()
                        .map(|&index| (index, (step.dispatch)(&self.state, &items[index])))
                        .collect();
                    let bus = self.bus;
                    let dispatches = requests.into_iter().map(|(index, request)| async move {
                        (index, bus.dispatch(request).await)
                    });
                    outcomes.extend(join_all(dispatches).await);
                }
            } else {
                for &index in batch {
                    let request = (step.dispatch)(&self.state, &items[index]);
                    outcomes.push((index, self.bus.dispatch(request).await));
                }
            }

            let mut first_failure: Option<BusError> = None;
            for (index, outcome) in outcomes {
                self.bump_iterations()?;
                match outcome {
                    Ok(response) => {
                        if let Some(hook) = &step.on_item_success {
                            hook(&mut self.state, &items[index], &response);
                        }
                        let kept = if options.streaming { None } else { Some(response) };
                        progress.record_success(index, kept);
                    }
                    Err(error) => {
                        if let Some(hook) = &step.on_item_fail {
                            hook(&mut self.state, &items[index], &error.to_string());
                        }
                        progress.record_failure(index);
                        if !options.continue_on_failure && first_failure.is_none() {
                            first_failure = Some(error);
                        }
                    }
                }
            }

            self.store.save_foreach_progress(&progress).await?;
            self.persist(FlowStatus::Running, self.position.clone(), None)
                .await
                .map_err(Interrupt::Infra)?;

            if let Some(error) = first_failure {
                return Err(self.failure(error.kind(), error.to_string()));
            }
        }

        if progress.failed.is_empty() {
            self.store.clear_foreach_progress(self.flow_id, &key).await?;
        } else {
            // Keep the record so hosts can inspect which items failed under
            // continue-on-failure.
            self.store.save_foreach_progress(&progress).await?;
        }
        Ok(Flow::Next)
    }
}
