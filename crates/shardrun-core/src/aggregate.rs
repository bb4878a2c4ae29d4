//! Merging shard reports into one global report.
//!
//! The aggregator runs once every worker has terminated. It never fails on bad
//! input: missing, partial or overlapping reports are counted as accurately as
//! possible and surfaced as issues on the resulting [`GlobalReport`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{CoreError, ItemId, Manifest, RunId, ShardId, ShardOutcome, ShardReport, StatusCounts};

/// A completeness or integrity problem found while aggregating.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateIssue {
    /// The manifest lists a shard that produced no report.
    MissingShard { shard_id: ShardId },

    /// The shard's report does not cover all of its items.
    PartialShard {
        shard_id: ShardId,
        expected: usize,
        reported: usize,
    },

    /// More than one report claims the same shard.
    DuplicateShardReport { shard_id: ShardId, reports: usize },

    /// A report names a shard the manifest does not know.
    UnexpectedShard { shard_id: ShardId },

    /// The same item id appears in more than one shard.
    DuplicateItem {
        item_id: ItemId,
        shard_ids: Vec<ShardId>,
    },
}

impl AggregateIssue {
    /// True for issues that indicate overlapping or foreign data.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::DuplicateShardReport { .. }
                | Self::UnexpectedShard { .. }
                | Self::DuplicateItem { .. }
        )
    }
}

/// Per-shard line of the global report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardBreakdown {
    pub shard_id: ShardId,
    pub outcome: ShardOutcome,
    pub expected_items: usize,
    pub reported_items: usize,
    pub counts: StatusCounts,
}

/// Merge of every shard report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalReport {
    pub run_id: RunId,

    /// Items the manifest promised.
    pub expected_items: usize,

    /// Items that reached a terminal status, each counted once.
    pub total_items: usize,

    #[serde(flatten)]
    pub counts: StatusCounts,

    /// `success / total_items`, 0 when nothing was counted.
    pub success_rate: f64,

    /// False if any shard is missing or partial.
    pub complete: bool,

    /// False if duplicate or unexpected data was detected.
    pub integrity_ok: bool,

    /// Per-shard breakdown sorted by shard id.
    pub shards: Vec<ShardBreakdown>,

    /// Sorted list of detected problems.
    pub issues: Vec<AggregateIssue>,
}

impl GlobalReport {
    /// Turn the report's flags into an error, integrity problems first.
    pub fn check(&self) -> Result<(), CoreError> {
        if !self.integrity_ok {
            let n = self.issues.iter().filter(|i| i.is_integrity()).count();
            return Err(CoreError::DataIntegrity(format!(
                "{} integrity issue(s) in run {}",
                n, self.run_id
            )));
        }
        if !self.complete {
            let n = self.issues.iter().filter(|i| !i.is_integrity()).count();
            return Err(CoreError::IncompleteRun(format!(
                "{} shard(s) missing or partial in run {}",
                n, self.run_id
            )));
        }
        Ok(())
    }
}

/// Aggregates shard reports against the manifest that produced the shards.
pub struct Aggregator<'a> {
    manifest: &'a Manifest,
}

impl<'a> Aggregator<'a> {
    /// Create a new Aggregator.
    pub fn new(manifest: &'a Manifest) -> Self {
        Self { manifest }
    }

    /// Merge `reports` into a global report.
    ///
    /// The result depends only on the set of reports, not their order.
    pub fn aggregate(&self, reports: Vec<ShardReport>) -> GlobalReport {
        let mut issues = Vec::new();

        let mut by_shard: BTreeMap<ShardId, Vec<ShardReport>> = BTreeMap::new();
        for report in reports {
            by_shard.entry(report.shard_id).or_default().push(report);
        }

        let mut chosen: BTreeMap<ShardId, ShardReport> = BTreeMap::new();
        for (shard_id, mut candidates) in by_shard {
            if candidates.len() > 1 {
                warn!(shard_id = %shard_id, reports = candidates.len(), "Duplicate shard reports");
                issues.push(AggregateIssue::DuplicateShardReport {
                    shard_id,
                    reports: candidates.len(),
                });
                // Serialized form breaks remaining ties so input order never decides.
                candidates.sort_by_cached_key(|r| {
                    (
                        Reverse(r.finalized().count()),
                        r.finished_at,
                        r.started_at,
                        serde_json::to_string(r).unwrap_or_default(),
                    )
                });
            }
            if let Some(report) = candidates.into_iter().next() {
                chosen.insert(shard_id, report);
            }
        }

        let shard_ids: BTreeSet<ShardId> = self
            .manifest
            .shard_ids()
            .chain(chosen.keys().copied())
            .collect();

        let mut owners: HashMap<ItemId, ShardId> = HashMap::new();
        let mut duplicates: BTreeMap<ItemId, BTreeSet<ShardId>> = BTreeMap::new();
        let mut totals = StatusCounts::default();
        let mut shards = Vec::with_capacity(shard_ids.len());

        for shard_id in shard_ids {
            let manifest_expected = self.manifest.expected_items(shard_id);

            let Some(report) = chosen.get(&shard_id) else {
                let expected = manifest_expected.unwrap_or_default();
                warn!(shard_id = %shard_id, "Shard report missing");
                issues.push(AggregateIssue::MissingShard { shard_id });
                shards.push(ShardBreakdown {
                    shard_id,
                    outcome: ShardOutcome::Missing,
                    expected_items: expected,
                    reported_items: 0,
                    counts: StatusCounts::default(),
                });
                continue;
            };

            let expected = match manifest_expected {
                Some(n) => n,
                None => {
                    warn!(shard_id = %shard_id, "Report for shard not in manifest");
                    issues.push(AggregateIssue::UnexpectedShard { shard_id });
                    report.expected_items
                }
            };

            let mut counts = StatusCounts::default();
            let mut reported = 0;
            for item in report.finalized() {
                reported += 1;
                match owners.get(&item.id) {
                    Some(first) => {
                        let entry = duplicates.entry(item.id.clone()).or_default();
                        entry.insert(*first);
                        entry.insert(shard_id);
                    }
                    None => {
                        owners.insert(item.id.clone(), shard_id);
                        counts.record(item.status());
                    }
                }
            }

            let outcome = if report.is_complete() && report.expected_items == expected {
                ShardOutcome::Complete
            } else {
                debug!(shard_id = %shard_id, expected, reported, "Shard report is partial");
                issues.push(AggregateIssue::PartialShard {
                    shard_id,
                    expected,
                    reported,
                });
                ShardOutcome::Partial
            };

            totals.merge(&counts);
            shards.push(ShardBreakdown {
                shard_id,
                outcome,
                expected_items: expected,
                reported_items: reported,
                counts,
            });
        }

        for (item_id, shard_ids) in duplicates {
            warn!(item_id = %item_id, "Item reported by more than one shard");
            issues.push(AggregateIssue::DuplicateItem {
                item_id,
                shard_ids: shard_ids.into_iter().collect(),
            });
        }
        issues.sort();

        let total_items = totals.total();
        let success_rate = if total_items == 0 {
            0.0
        } else {
            totals.success as f64 / total_items as f64
        };

        GlobalReport {
            run_id: self.manifest.run_id.clone(),
            expected_items: self.manifest.total_items,
            total_items,
            counts: totals,
            success_rate,
            complete: !issues
                .iter()
                .any(|i| matches!(i, AggregateIssue::MissingShard { .. } | AggregateIssue::PartialShard { .. })),
            integrity_ok: !issues.iter().any(AggregateIssue::is_integrity),
            shards,
            issues,
        }
    }
}

/// Merge `reports` into a global report for `manifest`.
pub fn aggregate(manifest: &Manifest, reports: Vec<ShardReport>) -> GlobalReport {
    Aggregator::new(manifest).aggregate(reports)
}
