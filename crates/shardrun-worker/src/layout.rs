//! On-disk contract between the sharding, worker and aggregation stages.
//!
//! ```text
//! <root>/manifest.json
//! <root>/matrix-output.json
//! <root>/shards/work-items-shard-<id>.json
//! <root>/reports/report-shard-<id>.json
//! <root>/global-report.json
//! <root>/artifacts/
//! <root>/workspace/
//! ```

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use shardrun_core::{GlobalReport, Manifest, Shard, ShardId, ShardPlan, ShardReport};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;

const REPORT_PREFIX: &str = "report-shard-";

/// Errors reading or writing the run layout.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Expected a JSON array of work descriptors in {0}")]
    NotAnArray(PathBuf),
}

/// Paths of one run's persisted artifacts.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn matrix_path(&self) -> PathBuf {
        self.root.join("matrix-output.json")
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.root.join("shards")
    }

    pub fn shard_path(&self, shard_id: ShardId) -> PathBuf {
        self.shards_dir()
            .join(format!("work-items-shard-{}.json", shard_id))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn report_path(&self, shard_id: ShardId) -> PathBuf {
        self.reports_dir()
            .join(format!("{}{}.json", REPORT_PREFIX, shard_id))
    }

    pub fn global_report_path(&self) -> PathBuf {
        self.root.join("global-report.json")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Worker config pointing at this layout's artifact and workspace dirs.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workspace_dir: self.workspace_dir(),
            artifact_dir: self.artifacts_dir(),
            ..WorkerConfig::default()
        }
    }

    /// Persist every shard, the manifest and the CI matrix.
    ///
    /// Shards are written first so the manifest never names a shard whose
    /// file is missing.
    pub async fn write_plan(&self, plan: &ShardPlan) -> Result<(), LayoutError> {
        for shard in &plan.shards {
            write_json(&self.shard_path(shard.shard_id), shard).await?;
            debug!(shard_id = %shard.shard_id, items = shard.len(), "Wrote shard");
        }
        write_json(&self.manifest_path(), &plan.manifest).await?;
        write_json(&self.matrix_path(), &plan.manifest.to_matrix()).await?;
        info!(
            shards = plan.shards.len(),
            root = %self.root.display(),
            "Wrote shard plan"
        );
        Ok(())
    }

    pub async fn read_manifest(&self) -> Result<Manifest, LayoutError> {
        read_json(&self.manifest_path()).await
    }

    pub async fn read_shard(&self, shard_id: ShardId) -> Result<Shard, LayoutError> {
        read_json(&self.shard_path(shard_id)).await
    }

    pub async fn write_report(&self, report: &ShardReport) -> Result<PathBuf, LayoutError> {
        let path = self.report_path(report.shard_id);
        write_json(&path, report).await?;
        Ok(path)
    }

    /// Read every report in this layout's reports directory.
    pub async fn read_reports(&self) -> Result<Vec<ShardReport>, LayoutError> {
        read_reports_in(&self.reports_dir()).await
    }

    pub async fn write_global_report(&self, report: &GlobalReport) -> Result<PathBuf, LayoutError> {
        let path = self.global_report_path();
        write_json(&path, report).await?;
        Ok(path)
    }

    pub async fn read_global_report(&self) -> Result<GlobalReport, LayoutError> {
        read_json(&self.global_report_path()).await
    }
}

/// Read every `report-shard-*.json` file in `dir`.
///
/// A missing directory yields no reports. Unreadable or malformed files are
/// logged and skipped so the aggregator sees their shard as missing.
pub async fn read_reports_in(dir: &Path) -> Result<Vec<ShardReport>, LayoutError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "Reports directory does not exist");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(LayoutError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut paths = Vec::new();
    loop {
        let entry = entries.next_entry().await.map_err(|source| LayoutError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let Some(entry) = entry else { break };
        let path = entry.path();
        let is_report = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(REPORT_PREFIX) && n.ends_with(".json"))
            .unwrap_or(false);
        if is_report {
            paths.push(path);
        }
    }
    paths.sort();

    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        match read_json::<ShardReport>(&path).await {
            Ok(report) => reports.push(report),
            Err(e) => warn!(error = %e, "Skipping unreadable shard report"),
        }
    }
    Ok(reports)
}

/// Read a JSON array of raw work descriptors produced by a listing.
pub async fn read_descriptors(path: &Path) -> Result<Vec<serde_json::Value>, LayoutError> {
    match read_json::<serde_json::Value>(path).await? {
        serde_json::Value::Array(items) => Ok(items),
        _ => Err(LayoutError::NotAnArray(path.to_path_buf())),
    }
}

/// Read and deserialize a JSON file.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, LayoutError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| LayoutError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| LayoutError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write pretty JSON to a temporary sibling, then rename it into place.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), LayoutError> {
    let io_err = |source| LayoutError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let mut json = serde_json::to_vec_pretty(value).map_err(|source| LayoutError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    json.push(b'\n');

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &json).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
