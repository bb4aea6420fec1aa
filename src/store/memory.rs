//! In-memory snapshot store for tests, demos, and single-process hosts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::progress::ForEachProgress;
use crate::snapshot::FlowSnapshot;
use crate::wait::{BranchSignal, RecordOutcome, WaitCondition, WaitUpdate};

use super::{SnapshotStore, StoreError};

#[derive(Default)]
struct Inner {
    snapshots: FxHashMap<String, FlowSnapshot>,
    waits: FxHashMap<String, WaitCondition>,
    progress: FxHashMap<(String, String), ForEachProgress>,
}

/// Process-local [`SnapshotStore`] backed by hash maps under one lock.
///
/// Holding a single `RwLock` over all three tables gives the atomicity the
/// store contract asks of `update` and `update_wait_condition` for free.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    inner: RwLock<Inner>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn create(&self, snapshot: &FlowSnapshot) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        if inner.snapshots.contains_key(&snapshot.flow_id) {
            return Ok(false);
        }
        inner
            .snapshots
            .insert(snapshot.flow_id.clone(), snapshot.clone());
        Ok(true)
    }

    async fn get(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, StoreError> {
        Ok(self.inner.read().snapshots.get(flow_id).cloned())
    }

    async fn update(&self, snapshot: &FlowSnapshot) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.snapshots.get_mut(&snapshot.flow_id) else {
            return Ok(false);
        };
        if stored.version != snapshot.version {
            return Ok(false);
        }
        let mut next = snapshot.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next;
        Ok(true)
    }

    async fn delete(&self, flow_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().snapshots.remove(flow_id).is_some())
    }

    async fn set_wait_condition(&self, condition: &WaitCondition) -> Result<(), StoreError> {
        self.inner
            .write()
            .waits
            .insert(condition.correlation_id.clone(), condition.clone());
        Ok(())
    }

    async fn wait_condition(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WaitCondition>, StoreError> {
        Ok(self.inner.read().waits.get(correlation_id).cloned())
    }

    async fn update_wait_condition(
        &self,
        correlation_id: &str,
        signal: BranchSignal,
    ) -> Result<WaitUpdate, StoreError> {
        let mut inner = self.inner.write();
        let condition =
            inner
                .waits
                .get_mut(correlation_id)
                .ok_or_else(|| StoreError::UnknownWait {
                    correlation_id: correlation_id.to_string(),
                })?;
        let branch_id = signal.branch_id.clone();
        match condition.record(signal) {
            RecordOutcome::UnknownBranch => Err(StoreError::UnknownBranch {
                correlation_id: correlation_id.to_string(),
                branch_id,
            }),
            RecordOutcome::Recorded | RecordOutcome::Duplicate => Ok(WaitUpdate {
                is_complete: condition.is_resolved(),
                results: condition.results.clone(),
            }),
        }
    }

    async fn clear_wait_condition(&self, correlation_id: &str) -> Result<(), StoreError> {
        self.inner.write().waits.remove(correlation_id);
        Ok(())
    }

    async fn timed_out_wait_conditions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WaitCondition>, StoreError> {
        Ok(self
            .inner
            .read()
            .waits
            .values()
            .filter(|c| !c.is_resolved() && c.timed_out_at(now))
            .cloned()
            .collect())
    }

    async fn save_foreach_progress(&self, progress: &ForEachProgress) -> Result<(), StoreError> {
        self.inner.write().progress.insert(
            (progress.flow_id.clone(), progress.step.clone()),
            progress.clone(),
        );
        Ok(())
    }

    async fn foreach_progress(
        &self,
        flow_id: &str,
        step: &str,
    ) -> Result<Option<ForEachProgress>, StoreError> {
        Ok(self
            .inner
            .read()
            .progress
            .get(&(flow_id.to_string(), step.to_string()))
            .cloned())
    }

    async fn clear_foreach_progress(&self, flow_id: &str, step: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .progress
            .remove(&(flow_id.to_string(), step.to_string()));
        Ok(())
    }
}
