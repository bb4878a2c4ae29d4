//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration.
///
/// Everything a worker needs is passed in here; nothing is read from the
/// process environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Scratch directory for per-item checkouts.
    pub workspace_dir: PathBuf,

    /// Directory receiving packaged artifacts.
    pub artifact_dir: PathBuf,

    /// Items processed at once within the shard (1 = strictly sequential).
    pub max_concurrent_items: usize,

    /// Organisation recorded for items whose payload does not name one.
    pub default_org: Option<String>,

    /// Per-shard time budget; the shard is cancelled when it runs out.
    pub shard_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("output/workspace"),
            artifact_dir: PathBuf::from("output/artifacts"),
            max_concurrent_items: 1,
            default_org: None,
            shard_timeout: None,
        }
    }
}

/// Settings for the process-backed collaborators.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Path to the git binary.
    pub git_path: String,

    /// Clone with `--depth 1`.
    pub shallow_clone: bool,

    /// Timeout for a single clone.
    pub fetch_timeout: Duration,

    /// Path to the tar binary.
    pub tar_path: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            git_path: "git".to_string(),
            shallow_clone: true,
            fetch_timeout: Duration::from_secs(300),
            tar_path: "tar".to_string(),
        }
    }
}
