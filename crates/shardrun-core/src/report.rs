//! Per-shard reports produced by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ItemStatus, ShardId, WorkItem};

/// Terminal-state counts for a set of items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub failed: usize,
    pub retryable: usize,
}

impl StatusCounts {
    /// Count one item by status. Pending items are not counted.
    pub fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Success => self.success += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Retryable => self.retryable += 1,
            ItemStatus::Pending => {}
        }
    }

    /// Sum of all terminal outcomes.
    pub fn total(&self) -> usize {
        self.success + self.failed + self.retryable
    }

    /// Add another set of counts into this one.
    pub fn merge(&mut self, other: &StatusCounts) {
        self.success += other.success;
        self.failed += other.failed;
        self.retryable += other.retryable;
    }
}

/// Terminal-state summary of every item a worker finalized for one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReport {
    pub shard_id: ShardId,

    /// Number of items the shard contained.
    pub expected_items: usize,

    /// Finalized items in shard order.
    pub items: Vec<WorkItem>,

    pub counts: StatusCounts,

    /// True if the worker stopped before finishing the shard.
    #[serde(default)]
    pub cancelled: bool,

    /// Organisation the worker applied to items that did not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ShardReport {
    /// Build a report from finalized items, computing counts.
    pub fn new(
        shard_id: ShardId,
        expected_items: usize,
        items: Vec<WorkItem>,
        cancelled: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut counts = StatusCounts::default();
        for item in &items {
            counts.record(item.status());
        }
        Self {
            shard_id,
            expected_items,
            items,
            counts,
            cancelled,
            org: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Builder method to record the worker's default organisation.
    pub fn with_org(mut self, org: Option<String>) -> Self {
        self.org = org;
        self
    }

    /// True if every input item reached a terminal status.
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self.items.len() == self.expected_items
            && self.items.iter().all(|i| i.status().is_terminal())
    }

    /// Items that finished, skipping any still pending.
    pub fn finalized(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|i| i.status().is_terminal())
    }
}
