//! Durable per-item bookkeeping for `ForEach` steps.
//!
//! A [`ForEachProgress`] record is created on first entry into a `ForEach`
//! step, updated as items (or batches) complete, and cleared when the step
//! finishes. It is what lets an interrupted collection step resume with
//! exactly the unprocessed items: given N items and k completed indices, a
//! resumed run processes exactly N − k.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-item completion/failure bookkeeping for one `ForEach` step of one
/// flow instance.
///
/// Invariants: `completed` and `failed` are disjoint; `current_index` is the
/// smallest unprocessed index under sequential semantics, or the start of
/// the batch in flight under batched semantics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ForEachProgress {
    pub flow_id: String,
    /// Position key of the owning `ForEach` node within its flow.
    pub step: String,
    pub total: usize,
    pub current_index: usize,
    pub current_batch: usize,
    pub completed: BTreeSet<usize>,
    pub failed: Vec<usize>,
    /// Item index (stringified for JSON round-trip) to response value.
    /// Empty under streaming semantics to bound the working set.
    #[serde(default)]
    pub item_results: BTreeMap<String, Value>,
}

impl ForEachProgress {
    pub fn new(flow_id: impl Into<String>, step: impl Into<String>, total: usize) -> Self {
        Self {
            flow_id: flow_id.into(),
            step: step.into(),
            total,
            current_index: 0,
            current_batch: 0,
            completed: BTreeSet::new(),
            failed: Vec::new(),
            item_results: BTreeMap::new(),
        }
    }

    /// Whether every item has been either completed or recorded as failed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.completed.len() + self.failed.len() >= self.total
    }

    /// Whether the given index has already been processed (either way).
    #[must_use]
    pub fn is_processed(&self, index: usize) -> bool {
        self.completed.contains(&index) || self.failed.contains(&index)
    }

    /// Indices still awaiting processing, in ascending order.
    pub fn remaining(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.total).filter(move |i| !self.is_processed(*i))
    }

    /// Records a successful item. A retried item previously recorded as
    /// failed moves to completed, preserving disjointness.
    pub fn record_success(&mut self, index: usize, result: Option<Value>) {
        self.failed.retain(|i| *i != index);
        self.completed.insert(index);
        if let Some(value) = result {
            self.item_results.insert(index.to_string(), value);
        }
        self.advance_cursor();
    }

    /// Records a failed item under continue-on-failure semantics.
    pub fn record_failure(&mut self, index: usize) {
        if !self.completed.contains(&index) && !self.failed.contains(&index) {
            self.failed.push(index);
        }
        self.advance_cursor();
    }

    /// Keeps `current_index` at the smallest unprocessed index.
    fn advance_cursor(&mut self) {
        let next = self.remaining().next().unwrap_or(self.total);
        self.current_index = next;
    }
}
