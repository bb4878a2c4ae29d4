//! Local scheduler - runs one isolated worker per shard on this machine.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use shardrun_core::{Manifest, ShardId};
use shardrun_worker::{RunLayout, Worker};

/// Fans shards out to workers, at most `parallel` at a time.
pub struct LocalScheduler {
    layout: RunLayout,
    worker: Worker,
    parallel: usize,
}

impl LocalScheduler {
    /// Create a new LocalScheduler.
    pub fn new(layout: RunLayout, worker: Worker, parallel: usize) -> Self {
        Self {
            layout,
            worker,
            parallel: parallel.max(1),
        }
    }

    /// Run every shard of `manifest` and wait for all workers to terminate.
    ///
    /// Returns the ids of shards whose worker produced no report. Those
    /// shards are left for the aggregator to flag as missing.
    pub async fn run(&self, manifest: &Manifest) -> Vec<ShardId> {
        let permits = Arc::new(Semaphore::new(self.parallel));
        let mut tasks = JoinSet::new();

        for shard_id in manifest.shard_ids() {
            let layout = self.layout.clone();
            let worker = self.worker.clone();
            let permits = permits.clone();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let ok = run_shard(&layout, &worker, shard_id).await;
                (shard_id, ok)
            });
        }

        info!(
            shards = manifest.shards.len(),
            parallel = self.parallel,
            "Dispatched shards"
        );

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, true)) => {}
                Ok((shard_id, false)) => failed.push(shard_id),
                Err(e) => error!(error = %e, "Worker task crashed"),
            }
        }

        // Crashed tasks lose their shard id; recover it from the reports on disk.
        for shard_id in manifest.shard_ids() {
            if !failed.contains(&shard_id) && !self.layout.report_path(shard_id).exists() {
                failed.push(shard_id);
            }
        }
        failed.sort();
        failed
    }
}

/// Load, process and persist one shard. Returns false if no report was written.
async fn run_shard(layout: &RunLayout, worker: &Worker, shard_id: ShardId) -> bool {
    let shard = match layout.read_shard(shard_id).await {
        Ok(shard) => shard,
        Err(e) => {
            error!(shard_id = %shard_id, error = %e, "Failed to load shard");
            return false;
        }
    };

    let report = worker.process(shard).await;
    if report.cancelled {
        warn!(shard_id = %shard_id, "Shard finished partially");
    }

    match layout.write_report(&report).await {
        Ok(path) => {
            info!(shard_id = %shard_id, report = %path.display(), "Shard report written");
            true
        }
        Err(e) => {
            error!(shard_id = %shard_id, error = %e, "Failed to write shard report");
            false
        }
    }
}
