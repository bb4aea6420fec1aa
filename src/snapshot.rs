//! Flow snapshots: the durable record of one flow instance.
//!
//! A [`FlowSnapshot`] is owned exclusively by the snapshot store; the
//! executor holds only a transient in-memory copy while running. State is
//! kept serialized (`serde_json::Value`) so the store contract stays
//! independent of the caller's state type, mirroring how persisted shapes
//! are decoupled from in-memory representations elsewhere in this crate.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::position::FlowPosition;

/// Lifecycle status of a flow instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

/// Serialization errors while moving state in and out of a snapshot.
#[derive(Debug, Error, Diagnostic)]
pub enum SnapshotError {
    #[error("flow state serialization failed: {source}")]
    #[diagnostic(
        code(flowstitch::snapshot::serde),
        help("The flow state type must round-trip through serde_json.")
    )]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

/// A failure whose rethrow is deferred because a `Finally` region suspended
/// before it could propagate. Rethrown once the finally completes on a later
/// leg.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingFailure {
    pub kind: String,
    pub message: String,
    /// Fatal failures stay fatal across the suspension.
    pub fatal: bool,
    /// Where the failure originally occurred.
    pub position: FlowPosition,
}

/// The durable record of a flow's state, position, and status.
///
/// Created once per flow instance, mutated on every suspension or
/// completion, and never deleted automatically; removal is an explicit
/// `delete` on the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Unique, caller-supplied flow instance id.
    pub flow_id: String,
    /// The caller's state, serialized.
    pub state: Value,
    /// Resume cursor: the node to re-enter on `resume`.
    pub position: FlowPosition,
    pub status: FlowStatus,
    /// Monotonic, starts at 1, incremented by the store on each successful
    /// `update`.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Correlation id of the wait condition this flow is suspended on, if
    /// any.
    #[serde(default)]
    pub wait: Option<String>,
    /// A failure waiting to be rethrown after a suspended `Finally` region
    /// completes.
    #[serde(default)]
    pub pending_failure: Option<PendingFailure>,
}

impl FlowSnapshot {
    /// A fresh snapshot for a new flow instance: version 1, `Running`, at
    /// the root position.
    pub fn new<S: Serialize>(
        flow_id: impl Into<String>,
        state: &S,
    ) -> Result<Self, SnapshotError> {
        let now = Utc::now();
        Ok(Self {
            flow_id: flow_id.into(),
            state: serde_json::to_value(state)?,
            position: FlowPosition::root(),
            status: FlowStatus::Running,
            version: 1,
            created_at: now,
            updated_at: now,
            wait: None,
            pending_failure: None,
        })
    }

    /// Deserializes the stored state into the caller's type.
    pub fn state_as<S: DeserializeOwned>(&self) -> Result<S, SnapshotError> {
        Ok(serde_json::from_value(self.state.clone())?)
    }

    /// Replaces the stored state with a freshly serialized copy.
    pub fn set_state<S: Serialize>(&mut self, state: &S) -> Result<(), SnapshotError> {
        self.state = serde_json::to_value(state)?;
        Ok(())
    }
}
