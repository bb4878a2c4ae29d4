//! Fetch collaborator backed by the `git` CLI.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use shardrun_core::Locator;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::collaborator::{FetchOutcome, FetchedArtifact, Fetcher};
use crate::config::ToolConfig;

/// Lower-cased fragments of git's stderr that indicate a network-class failure.
const TRANSIENT_MARKERS: &[&str] = &[
    "could not resolve host",
    "network",
    "timed out",
    "connection reset",
    "connection refused",
    "early eof",
    "the remote end hung up unexpectedly",
    "rate limit",
    "returned error: 5",
    "temporary failure",
];

/// Clones repositories with `git clone`.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git_path: String,
    shallow: bool,
    timeout: Duration,
}

impl GitFetcher {
    /// Create a new fetcher from tool settings.
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            git_path: config.git_path.clone(),
            shallow: config.shallow_clone,
            timeout: config.fetch_timeout,
        }
    }

    /// Short hash of the checked-out HEAD, if git can tell.
    async fn head_revision(&self, repo: &Path) -> Option<String> {
        let output = Command::new(&self.git_path)
            .arg("-C")
            .arg(repo)
            .args(["rev-parse", "--short=8", "HEAD"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!rev.is_empty()).then_some(rev)
    }
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self::new(&ToolConfig::default())
    }
}

#[async_trait]
impl Fetcher for GitFetcher {
    async fn fetch(&self, locator: &Locator, workspace: &Path) -> FetchOutcome {
        if let Err(e) = tokio::fs::create_dir_all(workspace).await {
            return FetchOutcome::Transient(format!(
                "failed to prepare workspace {}: {}",
                workspace.display(),
                e
            ));
        }

        let dest = workspace.join(&locator.name);
        let mut cmd = Command::new(&self.git_path);
        cmd.arg("clone");
        if self.shallow {
            cmd.args(["--depth", "1"]);
        }
        cmd.arg("--")
            .arg(&locator.url)
            .arg(&dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(repo = %locator.display_name(), url = %locator.url, "Cloning repository");
        debug!("Full command: {:?}", cmd);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                warn!(repo = %locator.display_name(), "Clone timed out");
                return FetchOutcome::Transient(format!(
                    "git clone timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
            Ok(Err(e)) => {
                return FetchOutcome::Permanent(format!(
                    "failed to run '{}': {}",
                    self.git_path, e
                ));
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return classify_clone_failure(&stderr);
        }

        let revision = self.head_revision(&dest).await;
        info!(repo = %locator.display_name(), revision = ?revision, "Clone finished");

        FetchOutcome::Fetched(FetchedArtifact {
            path: dest,
            name: locator.name.clone(),
            revision,
        })
    }
}

/// Decide whether a failed clone is worth re-driving.
///
/// The error text is preserved verbatim in either case.
pub fn classify_clone_failure(stderr: &str) -> FetchOutcome {
    let lower = stderr.to_lowercase();
    let message = if stderr.is_empty() {
        "git clone failed".to_string()
    } else {
        stderr.to_string()
    };

    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        FetchOutcome::Transient(message)
    } else {
        FetchOutcome::Permanent(message)
    }
}
