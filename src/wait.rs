//! Durable fork/join bookkeeping: wait conditions and branch signals.
//!
//! `WhenAll`/`WhenAny` steps are modelled as persisted counters plus an
//! ordered result list rather than in-process futures, because branches may
//! complete out-of-process or after a restart. A [`WaitCondition`] lives in
//! the snapshot store under its correlation id; branch completions arrive as
//! [`BranchSignal`]s through `update_wait_condition` and resolution is
//! re-checked whenever the owning flow is resumed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::position::FlowPosition;

/// Fork/join resolution rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitKind {
    /// Resolve when every expected branch has signalled.
    All,
    /// Resolve on the first signal; the winner is the first result recorded.
    Any,
}

/// One branch completion, recorded in arrival order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchSignal {
    pub branch_id: String,
    pub success: bool,
    pub value: Value,
}

impl BranchSignal {
    pub fn ok(branch_id: impl Into<String>, value: Value) -> Self {
        Self {
            branch_id: branch_id.into(),
            success: true,
            value,
        }
    }

    pub fn failed(branch_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            success: false,
            value: Value::String(message.into()),
        }
    }
}

/// Outcome of recording a signal against a wait condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordOutcome {
    Recorded,
    /// The branch already signalled; the duplicate is ignored.
    Duplicate,
    /// The branch id is not part of this condition.
    UnknownBranch,
}

/// Durable fork/join counter tracking how many parallel branches have
/// signalled completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitCondition {
    pub correlation_id: String,
    pub flow_id: String,
    /// Position of the owning join step within its flow.
    pub position: FlowPosition,
    pub kind: WaitKind,
    /// Number of branches the join was declared with.
    pub expected: usize,
    /// Declared branch ids; signals for other ids are rejected.
    pub branch_ids: Vec<String>,
    /// Signals in arrival order. `completed() == results.len()`.
    pub results: Vec<BranchSignal>,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    /// WhenAny only: late sibling signals are ignored best-effort once the
    /// condition is cleared.
    pub cancel_others: bool,
}

impl WaitCondition {
    pub fn new(
        correlation_id: impl Into<String>,
        flow_id: impl Into<String>,
        position: FlowPosition,
        kind: WaitKind,
        branch_ids: Vec<String>,
        timeout: Duration,
        cancel_others: bool,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            flow_id: flow_id.into(),
            position,
            kind,
            expected: branch_ids.len(),
            branch_ids,
            results: Vec::new(),
            created_at: Utc::now(),
            timeout,
            cancel_others,
        }
    }

    /// Number of branches that have signalled so far.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.results.len()
    }

    /// Whether the resolution rule is satisfied.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        match self.kind {
            WaitKind::All => self.completed() == self.expected,
            WaitKind::Any => self.completed() >= 1,
        }
    }

    /// The first-arrived signal: the winner under `WhenAny`.
    #[must_use]
    pub fn winner(&self) -> Option<&BranchSignal> {
        self.results.first()
    }

    /// Records a signal. Idempotent per distinct branch id: a duplicate
    /// signal never double-increments the completion count.
    pub(crate) fn record(&mut self, signal: BranchSignal) -> RecordOutcome {
        if !self.branch_ids.iter().any(|id| id == &signal.branch_id) {
            return RecordOutcome::UnknownBranch;
        }
        if self.results.iter().any(|r| r.branch_id == signal.branch_id) {
            return RecordOutcome::Duplicate;
        }
        self.results.push(signal);
        RecordOutcome::Recorded
    }

    /// Pull-based timeout check: `created_at + timeout < now`.
    #[must_use]
    pub fn timed_out_at(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.timeout) {
            Ok(timeout) => self.created_at + timeout < now,
            // A timeout too large for chrono is effectively "never".
            Err(_) => false,
        }
    }
}

/// `(is_complete, results)` returned from `update_wait_condition`.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitUpdate {
    pub is_complete: bool,
    pub results: Vec<BranchSignal>,
}
