//! Snapshot store: the durability contract of the engine.
//!
//! Everything the engine needs to survive a restart lives behind
//! [`SnapshotStore`]: flow snapshots, wait conditions, and `ForEach`
//! progress. Concurrency control is optimistic: `update` succeeds only when
//! the caller's version matches the stored one, and the store bumps the
//! version on every successful write. Backends must make
//! `update_wait_condition` atomic per correlation id so concurrent branch
//! signals cannot lose counts.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::progress::ForEachProgress;
use crate::snapshot::FlowSnapshot;
use crate::wait::{BranchSignal, WaitCondition, WaitUpdate};

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemorySnapshotStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSnapshotStore;

/// Errors surfaced by snapshot store backends.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("snapshot store backend error: {message}")]
    #[diagnostic(code(flowstitch::store::backend))]
    Backend { message: String },

    #[error("stored record could not be (de)serialized: {source}")]
    #[diagnostic(
        code(flowstitch::store::serde),
        help("The store holds JSON written by an incompatible schema version.")
    )]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    #[error("no wait condition registered under correlation id '{correlation_id}'")]
    #[diagnostic(code(flowstitch::store::unknown_wait))]
    UnknownWait { correlation_id: String },

    #[error("branch '{branch_id}' is not part of wait condition '{correlation_id}'")]
    #[diagnostic(code(flowstitch::store::unknown_branch))]
    UnknownBranch {
        correlation_id: String,
        branch_id: String,
    },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Durable storage for snapshots, wait conditions, and collection progress.
///
/// All methods take `&self`; implementations provide their own interior
/// synchronization.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists a brand-new snapshot. Returns `false` without writing when a
    /// snapshot already exists for the flow id.
    async fn create(&self, snapshot: &FlowSnapshot) -> Result<bool, StoreError>;

    /// Fetches the snapshot for a flow id, if any.
    async fn get(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, StoreError>;

    /// Conditionally overwrites a snapshot. Succeeds only when
    /// `snapshot.version` equals the stored version; the stored copy is then
    /// written with `version + 1`. Returns `false` on version mismatch or
    /// missing snapshot.
    async fn update(&self, snapshot: &FlowSnapshot) -> Result<bool, StoreError>;

    /// Removes a snapshot. Returns `false` when none existed.
    async fn delete(&self, flow_id: &str) -> Result<bool, StoreError>;

    /// Registers (or replaces) a wait condition under its correlation id.
    async fn set_wait_condition(&self, condition: &WaitCondition) -> Result<(), StoreError>;

    /// Fetches a wait condition by correlation id.
    async fn wait_condition(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WaitCondition>, StoreError>;

    /// Atomically records one branch signal against a wait condition and
    /// reports whether the condition is now resolved. Duplicate signals for
    /// a branch are ignored; signals for undeclared branches fail with
    /// [`StoreError::UnknownBranch`].
    async fn update_wait_condition(
        &self,
        correlation_id: &str,
        signal: BranchSignal,
    ) -> Result<WaitUpdate, StoreError>;

    /// Drops a wait condition once its join has resolved or been failed.
    async fn clear_wait_condition(&self, correlation_id: &str) -> Result<(), StoreError>;

    /// All wait conditions whose timeout has elapsed as of `now`. Timeouts
    /// are pull-based; nothing fires spontaneously.
    async fn timed_out_wait_conditions(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<WaitCondition>, StoreError>;

    /// Persists `ForEach` progress, keyed by `(flow_id, step)`.
    async fn save_foreach_progress(&self, progress: &ForEachProgress) -> Result<(), StoreError>;

    /// Fetches `ForEach` progress for one step of one flow.
    async fn foreach_progress(
        &self,
        flow_id: &str,
        step: &str,
    ) -> Result<Option<ForEachProgress>, StoreError>;

    /// Drops `ForEach` progress once the step has completed.
    async fn clear_foreach_progress(&self, flow_id: &str, step: &str) -> Result<(), StoreError>;
}
