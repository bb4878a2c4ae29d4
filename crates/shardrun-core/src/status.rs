//! Status enums for work items and shards.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a single WorkItem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Item not yet processed by its worker.
    #[default]
    Pending,
    /// Item fetched and archived.
    Success,
    /// Transient failure; an out-of-process re-drive may pick it up later.
    Retryable,
    /// Permanent failure.
    Failed,
}

impl ItemStatus {
    /// Returns true once the item has left `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Retryable => "RETRYABLE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Processing stage of an item inside a worker.
///
/// `Validating → Fetching → Archiving`, then one terminal
/// [`ItemStatus`]. Only the status is persisted; stages exist for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStage {
    Validating,
    Fetching,
    Archiving,
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validating => "validating",
            Self::Fetching => "fetching",
            Self::Archiving => "archiving",
        };
        f.write_str(s)
    }
}

/// Outcome of a shard as seen by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardOutcome {
    /// Report present and covers every item of the shard.
    Complete,
    /// Report present but the worker was cancelled or the report is short.
    Partial,
    /// No report was produced.
    Missing,
}

