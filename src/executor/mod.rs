//! The flow executor: runs, suspends, resumes, and signals flow instances.
//!
//! One [`FlowExecutor`] serves one flow definition against one bus and one
//! store, and any number of flow instances. All durable effects go through
//! the [`SnapshotStore`]; all external effects go through the
//! [`RequestBus`]. The executor itself keeps no per-flow state between
//! calls, which is what allows a different process to pick up a suspended
//! flow.

use std::sync::Arc;

use chrono::Utc;
use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use crate::bus::RequestBus;
use crate::flow::FlowConfig;
use crate::position::{FlowPosition, PositionError};
use crate::snapshot::{FlowStatus, SnapshotError};
use crate::store::{SnapshotStore, StoreError};
use crate::wait::{BranchSignal, WaitCondition};

mod interp;

use interp::Interp;

/// Errors surfaced by executor entry points.
///
/// These are host-facing infrastructure problems. Failures *inside* a flow
/// (a rejected request, a tripped governor) are not errors here; they come
/// back as a [`FlowResult`] with `Failed` status.
#[derive(Debug, Error, Diagnostic)]
pub enum FlowError {
    #[error("a flow with id '{flow_id}' already exists")]
    #[diagnostic(
        code(flowstitch::executor::duplicate_flow),
        help("Flow ids must be unique per store; resume the existing flow or pick a new id.")
    )]
    DuplicateFlow { flow_id: String },

    #[error("no flow with id '{flow_id}'")]
    #[diagnostic(code(flowstitch::executor::flow_not_found))]
    FlowNotFound { flow_id: String },

    #[error("flow '{flow_id}' is {status:?} and cannot be resumed")]
    #[diagnostic(
        code(flowstitch::executor::not_resumable),
        help("Only running or suspended flows can be resumed.")
    )]
    NotResumable { flow_id: String, status: FlowStatus },

    #[error("snapshot for flow '{flow_id}' was modified concurrently")]
    #[diagnostic(
        code(flowstitch::executor::snapshot_conflict),
        help("Another executor advanced this flow; re-read the snapshot before acting on it.")
    )]
    SnapshotConflict { flow_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("stored position does not resolve against this flow definition")]
    #[diagnostic(code(flowstitch::executor::corrupt_position))]
    CorruptPosition {
        #[from]
        source: PositionError,
    },
}

/// A failure that terminated a flow, as reported in a [`FlowResult`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowFailure {
    /// Machine-matchable failure kind (a bus rejection kind,
    /// `wait-timeout`, `branch-failed`, or a governor kind).
    pub kind: String,
    pub message: String,
    /// Where in the step tree the failure occurred.
    pub position: FlowPosition,
}

/// Handle to the wait condition a suspended flow is parked on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitHandle {
    /// Key external signals must use.
    pub correlation_id: String,
    pub expected: usize,
    pub completed: usize,
}

/// Outcome of one execution leg (`run`, `resume`, or a resolving `signal`).
#[derive(Debug)]
pub struct FlowResult<S> {
    pub flow_id: String,
    pub status: FlowStatus,
    /// The flow state as of the end of the leg.
    pub state: S,
    /// Populated when `status` is `Failed`.
    pub error: Option<FlowFailure>,
    /// Populated when `status` is `Suspended`.
    pub wait: Option<WaitHandle>,
}

impl<S> FlowResult<S> {
    /// `true` unless the flow failed. A suspended flow is in progress, not
    /// unsuccessful.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status != FlowStatus::Failed
    }
}

/// Executes instances of one flow definition.
pub struct FlowExecutor<S> {
    flow: Arc<FlowConfig<S>>,
    bus: Arc<dyn RequestBus>,
    store: Arc<dyn SnapshotStore>,
}

impl<S> FlowExecutor<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(flow: FlowConfig<S>, bus: Arc<dyn RequestBus>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            flow: Arc::new(flow),
            bus,
            store,
        }
    }

    pub fn flow(&self) -> &FlowConfig<S> {
        &self.flow
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Starts a new flow instance from the given initial state and executes
    /// it until it completes, suspends, or fails.
    #[instrument(skip(self, state), fields(flow = %self.flow.name()), err)]
    pub async fn run(&self, flow_id: &str, state: S) -> Result<FlowResult<S>, FlowError> {
        let snapshot = crate::snapshot::FlowSnapshot::new(flow_id, &state)?;
        if !self.store.create(&snapshot).await? {
            return Err(FlowError::DuplicateFlow {
                flow_id: flow_id.to_string(),
            });
        }
        self.drive(flow_id, state, snapshot.version, snapshot.created_at, Vec::new(), None)
            .await
    }

    /// Starts a new flow instance under a generated id. Returns the id with
    /// the result so the host can address the flow later.
    pub async fn run_auto(&self, state: S) -> Result<FlowResult<S>, FlowError> {
        let flow_id = uuid::Uuid::new_v4().to_string();
        self.run(&flow_id, state).await
    }

    /// Picks a flow back up from its stored snapshot: re-enters the node at
    /// the stored position and continues. Completed work before the position
    /// is never repeated; in particular, dispatched `Send` requests are not
    /// reissued.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, flow_id: &str) -> Result<FlowResult<S>, FlowError> {
        let snapshot = self
            .store
            .get(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound {
                flow_id: flow_id.to_string(),
            })?;
        match snapshot.status {
            FlowStatus::Running | FlowStatus::Suspended => {}
            status => {
                return Err(FlowError::NotResumable {
                    flow_id: flow_id.to_string(),
                    status,
                })
            }
        }
        // Reject cursors captured from a different flow definition before
        // interpreting them.
        self.flow.resolve(&snapshot.position)?;
        let state = snapshot.state_as()?;
        self.drive(
            flow_id,
            state,
            snapshot.version,
            snapshot.created_at,
            snapshot.position.path().to_vec(),
            snapshot.pending_failure,
        )
        .await
    }

    /// Records one branch completion against a wait condition. When the
    /// signal resolves the condition, the owning flow is resumed and its
    /// result returned; otherwise `Ok(None)` means the join is still
    /// waiting.
    ///
    /// Signals for an already-cleared condition surface as
    /// [`StoreError::UnknownWait`]; hosts that allow late `WhenAny` signals
    /// can treat that error as benign.
    #[instrument(skip(self, signal), fields(branch = %signal.branch_id), err)]
    pub async fn signal(
        &self,
        correlation_id: &str,
        signal: BranchSignal,
    ) -> Result<Option<FlowResult<S>>, FlowError> {
        let update = self
            .store
            .update_wait_condition(correlation_id, signal)
            .await?;
        if !update.is_complete {
            tracing::debug!(
                correlation_id,
                completed = update.results.len(),
                "wait condition still open"
            );
            return Ok(None);
        }
        let condition = self
            .store
            .wait_condition(correlation_id)
            .await?
            .ok_or_else(|| StoreError::UnknownWait {
                correlation_id: correlation_id.to_string(),
            })?;
        Ok(Some(self.resume(&condition.flow_id).await?))
    }

    /// Wait conditions whose timeout has elapsed. Timeouts are pull-based;
    /// hosts poll this (or call [`fail_timed_out`](Self::fail_timed_out))
    /// on their own schedule.
    pub async fn timed_out_waits(&self) -> Result<Vec<WaitCondition>, FlowError> {
        Ok(self.store.timed_out_wait_conditions(Utc::now()).await?)
    }

    /// Resumes every flow parked on an expired wait condition. Each resumed
    /// flow observes a `wait-timeout` failure at its join, which `Catch`
    /// clauses may handle for compensation; unhandled, the flow fails.
    pub async fn fail_timed_out(&self) -> Result<Vec<FlowResult<S>>, FlowError> {
        let expired = self.store.timed_out_wait_conditions(Utc::now()).await?;
        let mut results = Vec::with_capacity(expired.len());
        for condition in expired {
            results.push(self.resume(&condition.flow_id).await?);
        }
        Ok(results)
    }

    async fn drive(
        &self,
        flow_id: &str,
        state: S,
        version: u64,
        created_at: chrono::DateTime<Utc>,
        cursor: Vec<usize>,
        pending_failure: Option<crate::snapshot::PendingFailure>,
    ) -> Result<FlowResult<S>, FlowError> {
        let mut interp = Interp::new(
            self.flow.governors(),
            self.bus.as_ref(),
            self.store.as_ref(),
            flow_id,
            state,
            version,
            created_at,
            cursor,
            pending_failure,
        );
        let outcome = interp.run_sequence(self.flow.steps()).await;
        interp.finish(outcome).await
    }
}
