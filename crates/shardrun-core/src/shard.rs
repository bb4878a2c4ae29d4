//! Balanced partitioning of work items into shards.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CoreError, RunId, ShardId, WorkItem};

/// A contiguous, size-balanced slice of the run's work items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: ShardId,
    pub items: Vec<WorkItem>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Manifest entry for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub shard_id: ShardId,
    pub item_count: usize,
}

/// Describes the shards of a run; consumed by the scheduler and the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Identifier of the partition run.
    pub run_id: RunId,

    /// Worker count that was asked for.
    pub requested_workers: u64,

    /// Worker count actually used (one per shard).
    pub effective_workers: u32,

    /// Total items across all shards.
    pub total_items: usize,

    /// Shards in id order.
    pub shards: Vec<ManifestEntry>,
}

impl Manifest {
    /// Shard ids in order.
    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.shards.iter().map(|e| e.shard_id)
    }

    /// Expected item count of a shard, if it is part of the manifest.
    pub fn expected_items(&self, shard_id: ShardId) -> Option<usize> {
        self.shards
            .iter()
            .find(|e| e.shard_id == shard_id)
            .map(|e| e.item_count)
    }

    /// Render as a CI job matrix: `{"matrix":{"include":[{"shard_id":0},...]}}`.
    pub fn to_matrix(&self) -> serde_json::Value {
        let include: Vec<serde_json::Value> = self
            .shards
            .iter()
            .map(|e| serde_json::json!({ "shard_id": e.shard_id }))
            .collect();
        serde_json::json!({ "matrix": { "include": include } })
    }
}

/// Result of partitioning: the shards and the manifest describing them.
#[derive(Debug, Clone)]
pub struct ShardPlan {
    pub shards: Vec<Shard>,
    pub manifest: Manifest,
}

/// Partition `items` into at most `requested_workers` balanced shards.
///
/// The first `n % k` shards receive one extra item; slicing is contiguous so
/// concatenating shards in id order reproduces the input order. Requesting more
/// workers than items clamps the worker count to the item count.
pub fn shard(items: Vec<WorkItem>, requested_workers: i64) -> Result<ShardPlan, CoreError> {
    if requested_workers <= 0 {
        return Err(CoreError::Config(format!(
            "worker count must be at least 1, got {}",
            requested_workers
        )));
    }
    let requested = requested_workers.unsigned_abs();

    validate(&items)?;

    let total = items.len();
    let effective = usize::try_from(requested)
        .unwrap_or(usize::MAX)
        .min(total.max(1));
    if (effective as u64) < requested {
        debug!(requested, effective, total, "Clamping worker count to item count");
    }

    let mut shards = Vec::with_capacity(if total == 0 { 0 } else { effective });
    if total > 0 {
        let base = total / effective;
        let remainder = total % effective;
        let mut rest = items.into_iter();

        for index in 0..effective {
            let size = if index < remainder { base + 1 } else { base };
            shards.push(Shard {
                shard_id: ShardId::new(index as u32),
                items: rest.by_ref().take(size).collect(),
            });
        }
    }

    let manifest = Manifest {
        run_id: RunId::generate(),
        requested_workers: requested,
        effective_workers: shards.len() as u32,
        total_items: total,
        shards: shards
            .iter()
            .map(|s| ManifestEntry {
                shard_id: s.shard_id,
                item_count: s.len(),
            })
            .collect(),
    };

    Ok(ShardPlan { shards, manifest })
}

/// Refuse to partition items without an id or with colliding ids.
fn validate(items: &[WorkItem]) -> Result<(), CoreError> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if item.id.is_empty() {
            return Err(CoreError::Validation(format!(
                "item at position {} has no id",
                item.position
            )));
        }
        if !item.id.is_path_safe() {
            return Err(CoreError::Validation(format!(
                "item at position {} has an unusable id: {}",
                item.position, item.id
            )));
        }
        if !seen.insert(&item.id) {
            return Err(CoreError::Validation(format!(
                "duplicate item id: {}",
                item.id
            )));
        }
    }
    Ok(())
}
