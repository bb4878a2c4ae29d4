//! Shard execution.
//!
//! A [`Worker`] owns one shard and drives every item through
//! validate → fetch → archive → cleanup. A failing item never aborts the
//! shard; its outcome is recorded on the item and the next item runs.

use std::io;
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use shardrun_core::{ArtifactRef, ItemStage, Shard, ShardId, ShardReport, WorkItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborator::{Archiver, FetchOutcome, Fetcher};
use crate::config::WorkerConfig;
use crate::json_output;

/// Error recorded for items whose payload has no usable locator.
pub const INVALID_PAYLOAD: &str = "invalid payload";

/// Error recorded for items whose id cannot name a file.
pub const INVALID_ID: &str = "invalid item id";

/// Terminal result of one item's pipeline, before it is applied to the item.
#[derive(Debug)]
enum ItemResult {
    Success(ArtifactRef),
    Retryable(String),
    Failed(String),
}

/// Processes a single shard.
#[derive(Clone)]
pub struct Worker {
    config: WorkerConfig,
    fetcher: Arc<dyn Fetcher>,
    archiver: Arc<dyn Archiver>,
}

impl Worker {
    /// Create a new worker with the given collaborators.
    pub fn new(config: WorkerConfig, fetcher: Arc<dyn Fetcher>, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            config,
            fetcher,
            archiver,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Process every item of `shard` to a terminal status.
    ///
    /// Honors `shard_timeout` from the config, if set.
    pub async fn process(&self, shard: Shard) -> ShardReport {
        let cancel = CancellationToken::new();
        let timer = self.config.shard_timeout.map(|budget| {
            let cancel = cancel.clone();
            let shard_id = shard.shard_id;
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                warn!(shard_id = %shard_id, budget_secs = budget.as_secs(), "Shard time budget exhausted");
                cancel.cancel();
            })
        });

        let report = self.process_with_cancel(shard, cancel).await;

        if let Some(timer) = timer {
            timer.abort();
        }
        report
    }

    /// Process `shard` until done or until `cancel` fires.
    ///
    /// Items run concurrently and finish in any order; the report lists them
    /// by position. On cancellation the report keeps every item finalized so
    /// far, the in-flight items are dropped and `cancelled` is set.
    pub async fn process_with_cancel(&self, shard: Shard, cancel: CancellationToken) -> ShardReport {
        let started_at = Utc::now();
        let shard_id = shard.shard_id;
        let expected = shard.len();
        let shard_dir = self.config.workspace_dir.join(format!("shard-{}", shard_id));
        let concurrency = self.config.max_concurrent_items.max(1);

        info!(
            shard_id = %shard_id,
            items = expected,
            concurrency,
            "Starting shard"
        );
        json_output::emit_shard_started(shard_id, expected);

        let mut finished = Vec::with_capacity(expected);
        let mut cancelled = false;
        {
            let shard_dir = shard_dir.as_path();
            let mut results = pin!(stream::iter(shard.items)
                .map(|item| self.process_item(shard_id, shard_dir, item))
                .buffer_unordered(concurrency));

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // keep items that completed alongside the cancellation
                        while let Some(Some(item)) = results.next().now_or_never() {
                            json_output::emit_item_finished(shard_id, &item);
                            finished.push(item);
                        }
                        cancelled = true;
                        break;
                    }
                    next = results.next() => match next {
                        Some(item) => {
                            json_output::emit_item_finished(shard_id, &item);
                            finished.push(item);
                        }
                        None => break,
                    },
                }
            }
        }

        if cancelled {
            warn!(
                shard_id = %shard_id,
                finished = finished.len(),
                expected,
                "Shard cancelled before completion"
            );
        }

        finished.sort_by_key(|item| item.position);

        // Dropped in-flight items never reached their own cleanup.
        if let Err(e) = remove_dir_if_exists(&shard_dir).await {
            error!(shard_id = %shard_id, error = %e, "Failed to clean shard workspace");
        }

        let report = ShardReport::new(shard_id, expected, finished, cancelled, started_at)
            .with_org(self.config.default_org.clone());
        info!(
            shard_id = %shard_id,
            success = report.counts.success,
            failed = report.counts.failed,
            retryable = report.counts.retryable,
            cancelled,
            "Shard finished"
        );
        json_output::emit_shard_finished(&report);
        report
    }

    /// Run one item through the pipeline and apply its terminal status.
    async fn process_item(&self, shard_id: ShardId, shard_dir: &Path, mut item: WorkItem) -> WorkItem {
        if item.status().is_terminal() {
            debug!(item_id = %item.id, status = %item.status(), "Item already terminal, skipping");
            return item;
        }

        // Named by position so the item id never becomes a path component.
        let item_dir = shard_dir.join(format!("item-{}", item.position));
        let result = self.run_pipeline(&item, &item_dir).await;

        match remove_dir_if_exists(&item_dir).await {
            Ok(true) => debug!(item_id = %item.id, "Item workspace removed"),
            Ok(false) => {}
            Err(e) => warn!(item_id = %item.id, error = %e, "Failed to remove item workspace"),
        }

        let applied = match result {
            ItemResult::Success(artifact) => {
                info!(shard_id = %shard_id, item_id = %item.id, artifact = %artifact.location, "Item succeeded");
                item.mark_success(artifact)
            }
            ItemResult::Retryable(msg) => {
                warn!(shard_id = %shard_id, item_id = %item.id, error = %msg, "Item released for retry");
                item.mark_retryable(msg)
            }
            ItemResult::Failed(msg) => {
                warn!(shard_id = %shard_id, item_id = %item.id, error = %msg, "Item failed");
                item.mark_failed(msg)
            }
        };
        if let Err(e) = applied {
            error!(item_id = %item.id, error = %e, "Could not record item outcome");
        }

        item
    }

    async fn run_pipeline(&self, item: &WorkItem, item_dir: &Path) -> ItemResult {
        debug!(item_id = %item.id, stage = %ItemStage::Validating, "Item stage");
        if !item.id.is_path_safe() {
            return ItemResult::Failed(INVALID_ID.to_string());
        }
        let Some(mut locator) = item.payload.locator() else {
            return ItemResult::Failed(INVALID_PAYLOAD.to_string());
        };
        if locator.org.is_none() {
            locator.org = self.config.default_org.clone();
        }

        debug!(item_id = %item.id, stage = %ItemStage::Fetching, repo = %locator.display_name(), "Item stage");
        let fetched = match self.fetcher.fetch(&locator, item_dir).await {
            FetchOutcome::Fetched(fetched) => fetched,
            FetchOutcome::Transient(msg) => return ItemResult::Retryable(msg),
            FetchOutcome::Permanent(msg) => return ItemResult::Failed(msg),
        };

        debug!(item_id = %item.id, stage = %ItemStage::Archiving, "Item stage");
        match self
            .archiver
            .archive(&fetched, &self.config.artifact_dir, &item.id)
            .await
        {
            Ok(artifact) => ItemResult::Success(ArtifactRef {
                org: locator.org,
                ..artifact
            }),
            Err(e) => ItemResult::Failed(e.to_string()),
        }
    }
}

/// Remove `path` recursively. Returns `false` if there was nothing to remove.
async fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{ArchiveError, FetchedArtifact};
    use async_trait::async_trait;
    use shardrun_core::{shard, ItemId, ItemStatus, Locator, Payload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fetcher whose outcome depends on the URL.
    ///
    /// URLs containing `flaky` fail transiently, `gone` permanently and
    /// `hang` cancels `cancel_on_hang` then never returns.
    struct ScriptedFetcher {
        calls: AtomicUsize,
        cancel_on_hang: Option<CancellationToken>,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                cancel_on_hang: None,
            }
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, locator: &Locator, workspace: &Path) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let dest = workspace.join(&locator.name);
            tokio::fs::create_dir_all(&dest).await.unwrap();
            tokio::fs::write(dest.join("README"), b"hello").await.unwrap();

            if locator.url.contains("hang") {
                if let Some(cancel) = &self.cancel_on_hang {
                    cancel.cancel();
                }
                std::future::pending::<()>().await;
            }
            if locator.url.contains("flaky") {
                return FetchOutcome::Transient("Could not resolve host: example.com".into());
            }
            if locator.url.contains("gone") {
                return FetchOutcome::Permanent("repository not found".into());
            }
            FetchOutcome::Fetched(FetchedArtifact {
                path: dest,
                name: locator.name.clone(),
                revision: Some("deadbeef".into()),
            })
        }
    }

    /// Archiver that fails for repositories named `broken`.
    struct FakeArchiver;

    #[async_trait]
    impl Archiver for FakeArchiver {
        async fn archive(
            &self,
            fetched: &FetchedArtifact,
            artifact_dir: &Path,
            item_id: &ItemId,
        ) -> Result<ArtifactRef, ArchiveError> {
            if fetched.name == "broken" {
                return Err(ArchiveError::Tool("disk full".into()));
            }
            assert!(fetched.path.join("README").exists());
            Ok(ArtifactRef {
                location: artifact_dir
                    .join(format!("{}-{}.tar.gz", item_id, fetched.name))
                    .display()
                    .to_string(),
                revision: fetched.revision.clone(),
                org: None,
            })
        }
    }

    fn worker(root: &Path, fetcher: ScriptedFetcher, concurrency: usize) -> Worker {
        let config = WorkerConfig {
            workspace_dir: root.join("workspace"),
            artifact_dir: root.join("artifacts"),
            max_concurrent_items: concurrency,
            default_org: Some("acme".into()),
            shard_timeout: None,
        };
        Worker::new(config, Arc::new(fetcher), Arc::new(FakeArchiver))
    }

    fn single_shard(urls: &[Option<&str>]) -> Shard {
        let items = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let payload = match url {
                    Some(u) => Payload::with_url(*u),
                    None => Payload::default(),
                };
                WorkItem::new(i, payload)
            })
            .collect();
        shard(items, 1).unwrap().shards.remove(0)
    }

    fn statuses(report: &ShardReport) -> Vec<ItemStatus> {
        report.items.iter().map(|i| i.status()).collect()
    }

    #[tokio::test]
    async fn test_every_outcome_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path(), ScriptedFetcher::new(), 1);
        let shard = single_shard(&[
            Some("https://example.com/acme/ok.git"),
            None,
            Some("https://example.com/acme/flaky.git"),
            Some("https://example.com/acme/gone.git"),
            Some("https://example.com/acme/broken.git"),
        ]);

        let report = worker.process(shard).await;

        assert_eq!(report.items.len(), 5);
        assert_eq!(
            statuses(&report),
            vec![
                ItemStatus::Success,
                ItemStatus::Failed,
                ItemStatus::Retryable,
                ItemStatus::Failed,
                ItemStatus::Failed,
            ]
        );
        assert_eq!(report.items[1].error(), Some(INVALID_PAYLOAD));
        assert_eq!(report.items[3].error(), Some("repository not found"));
        assert!(report.items[4].error().unwrap().contains("disk full"));
        assert_eq!(
            report.items[0].artifact().and_then(|a| a.revision.as_deref()),
            Some("deadbeef")
        );
        assert_eq!(report.counts.success, 1);
        assert_eq!(report.counts.failed, 3);
        assert_eq!(report.counts.retryable, 1);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_workspace_removed_whatever_the_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path(), ScriptedFetcher::new(), 1);
        let shard = single_shard(&[
            Some("https://example.com/acme/ok.git"),
            Some("https://example.com/acme/gone.git"),
        ]);

        worker.process(shard).await;
        assert!(!dir.path().join("workspace").join("shard-0").exists());
    }

    #[tokio::test]
    async fn test_all_invalid_still_covers_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new();
        let worker = worker(dir.path(), fetcher, 1);
        let shard = single_shard(&[None, None, Some("   ")]);

        let report = worker.process(shard).await;
        assert_eq!(report.items.len(), 3);
        assert!(report
            .items
            .iter()
            .all(|i| i.status() == ItemStatus::Failed && i.error() == Some(INVALID_PAYLOAD)));
    }

    #[tokio::test]
    async fn test_invalid_payload_never_reaches_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        let config = WorkerConfig {
            workspace_dir: dir.path().join("workspace"),
            artifact_dir: dir.path().join("artifacts"),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(config, fetcher.clone(), Arc::new(FakeArchiver));

        worker.process(single_shard(&[None, None])).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_items_keep_shard_order() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path(), ScriptedFetcher::new(), 3);
        let urls: Vec<String> = (0..7)
            .map(|i| format!("https://example.com/acme/repo{}.git", i))
            .collect();
        let refs: Vec<Option<&str>> = urls.iter().map(|u| Some(u.as_str())).collect();

        let report = worker.process(single_shard(&refs)).await;
        let positions: Vec<usize> = report.items.iter().map(|i| i.position).collect();
        assert_eq!(positions, (0..7).collect::<Vec<_>>());
        assert_eq!(report.counts.success, 7);
    }

    #[tokio::test]
    async fn test_cancel_keeps_finished_items() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let fetcher = ScriptedFetcher {
            calls: AtomicUsize::new(0),
            cancel_on_hang: Some(cancel.clone()),
        };
        let worker = worker(dir.path(), fetcher, 1);
        let shard = single_shard(&[
            Some("https://example.com/acme/a.git"),
            Some("https://example.com/acme/b.git"),
            Some("https://example.com/acme/hang.git"),
            Some("https://example.com/acme/d.git"),
        ]);

        let report = worker.process_with_cancel(shard, cancel).await;

        assert!(report.cancelled);
        assert!(!report.is_complete());
        assert_eq!(report.expected_items, 4);
        assert_eq!(report.items.len(), 2);
        assert_eq!(report.counts.success, 2);
        assert!(!dir.path().join("workspace").join("shard-0").exists());
    }

    #[tokio::test]
    async fn test_cancel_keeps_items_finished_behind_a_slow_one() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path(), ScriptedFetcher::new(), 3);
        let shard = single_shard(&[
            Some("https://example.com/acme/hang.git"),
            Some("https://example.com/acme/a.git"),
            Some("https://example.com/acme/b.git"),
        ]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let report = worker.process_with_cancel(shard, cancel).await;

        assert!(report.cancelled);
        let positions: Vec<usize> = report.items.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(report.counts.success, 2);
    }

    #[tokio::test]
    async fn test_item_id_never_names_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        std::fs::create_dir_all(&victim).unwrap();
        std::fs::write(victim.join("precious.txt"), b"keep").unwrap();

        let fetcher = Arc::new(ScriptedFetcher::new());
        let config = WorkerConfig {
            workspace_dir: dir.path().join("workspace"),
            artifact_dir: dir.path().join("artifacts"),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(config, fetcher.clone(), Arc::new(FakeArchiver));
        let shard = Shard {
            shard_id: ShardId::new(0),
            items: vec![
                WorkItem::new(0, Payload::with_url("https://example.com/acme/ok.git")),
                WorkItem::new(1, Payload::default()).with_id(ItemId::new("../../victim")),
                WorkItem::new(2, Payload::with_url("https://example.com/acme/x.git"))
                    .with_id(ItemId::new("../../victim")),
            ],
        };

        let report = worker.process(shard).await;

        assert!(victim.join("precious.txt").exists());
        assert_eq!(report.items[0].status(), ItemStatus::Success);
        assert_eq!(report.items[1].error(), Some(INVALID_ID));
        assert_eq!(report.items[2].error(), Some(INVALID_ID));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_org_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path(), ScriptedFetcher::new(), 1);
        let shard = Shard {
            shard_id: ShardId::new(0),
            items: vec![
                WorkItem::new(0, Payload::with_url("https://example.com/a.git")),
                WorkItem::new(
                    1,
                    Payload::with_url("https://example.com/b.git").with_org("globex"),
                ),
            ],
        };

        let report = worker.process(shard).await;

        assert_eq!(report.org.as_deref(), Some("acme"));
        let orgs: Vec<Option<&str>> = report
            .items
            .iter()
            .map(|i| i.artifact().and_then(|a| a.org.as_deref()))
            .collect();
        assert_eq!(orgs, vec![Some("acme"), Some("globex")]);
    }

    #[tokio::test]
    async fn test_shard_timeout_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            workspace_dir: dir.path().join("workspace"),
            artifact_dir: dir.path().join("artifacts"),
            shard_timeout: Some(Duration::from_millis(50)),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(config, Arc::new(ScriptedFetcher::new()), Arc::new(FakeArchiver));
        let shard = single_shard(&[
            Some("https://example.com/acme/a.git"),
            Some("https://example.com/acme/hang.git"),
        ]);

        let report = worker.process(shard).await;
        assert!(report.cancelled);
        assert_eq!(report.items.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_items_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        let config = WorkerConfig {
            workspace_dir: dir.path().join("workspace"),
            artifact_dir: dir.path().join("artifacts"),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(config, fetcher.clone(), Arc::new(FakeArchiver));
        let mut shard = single_shard(&[Some("https://example.com/acme/a.git")]);
        shard.items[0].mark_failed("earlier run").unwrap();

        let report = worker.process(shard).await;
        assert_eq!(report.items[0].error(), Some("earlier run"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
