//! Archival collaborator backed by the `tar` CLI.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use shardrun_core::{ArtifactRef, ItemId};
use tokio::process::Command;
use tracing::info;

use crate::collaborator::{ArchiveError, Archiver, FetchedArtifact};
use crate::config::ToolConfig;

/// Packages a fetched directory as `<item_id>-<name>.tar.gz`.
#[derive(Debug, Clone)]
pub struct TarArchiver {
    tar_path: String,
}

impl TarArchiver {
    /// Create a new archiver from tool settings.
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            tar_path: config.tar_path.clone(),
        }
    }
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self::new(&ToolConfig::default())
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    async fn archive(
        &self,
        fetched: &FetchedArtifact,
        artifact_dir: &Path,
        item_id: &ItemId,
    ) -> Result<ArtifactRef, ArchiveError> {
        let (parent, dir_name) = match (fetched.path.parent(), fetched.path.file_name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => {
                return Err(ArchiveError::InvalidSource(
                    fetched.path.display().to_string(),
                ))
            }
        };

        if !item_id.is_path_safe() {
            return Err(ArchiveError::InvalidSource(format!("unusable item id {}", item_id)));
        }

        tokio::fs::create_dir_all(artifact_dir).await?;
        let dest = artifact_dir.join(format!("{}-{}.tar.gz", item_id, fetched.name));

        let output = Command::new(&self.tar_path)
            .arg("-czf")
            .arg(&dest)
            .arg("-C")
            .arg(parent)
            .arg(dir_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&dest).await;
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ArchiveError::Tool(stderr));
        }

        info!(item_id = %item_id, artifact = %dest.display(), "Artifact packaged");

        Ok(ArtifactRef {
            location: dest.display().to_string(),
            revision: fetched.revision.clone(),
            org: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_root_path_is_invalid_source() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = FetchedArtifact {
            path: PathBuf::from("/"),
            name: "root".to_string(),
            revision: None,
        };

        let err = TarArchiver::default()
            .archive(&fetched, dir.path(), &ItemId::new("wi-000001"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidSource(_)));
    }

    fn checkout(root: &Path) -> FetchedArtifact {
        let source = root.join("checkout").join("widgets");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("README.md"), b"# widgets").unwrap();
        FetchedArtifact {
            path: source,
            name: "widgets".to_string(),
            revision: Some("abc12345".to_string()),
        }
    }

    #[tokio::test]
    async fn test_archives_checkout_under_item_name() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = checkout(dir.path());
        let artifacts = dir.path().join("artifacts");

        let artifact = TarArchiver::default()
            .archive(&fetched, &artifacts, &ItemId::new("wi-000003"))
            .await
            .unwrap();

        let expected = artifacts.join("wi-000003-widgets.tar.gz");
        assert!(expected.exists());
        assert!(std::fs::metadata(&expected).unwrap().len() > 0);
        assert_eq!(artifact.location, expected.display().to_string());
        assert_eq!(artifact.revision.as_deref(), Some("abc12345"));
    }

    #[tokio::test]
    async fn test_tar_failure_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = FetchedArtifact {
            path: dir.path().join("checkout").join("vanished"),
            name: "vanished".to_string(),
            revision: None,
        };
        std::fs::create_dir_all(dir.path().join("checkout")).unwrap();
        let artifacts = dir.path().join("artifacts");

        let err = TarArchiver::default()
            .archive(&fetched, &artifacts, &ItemId::new("wi-000004"))
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Tool(_)));
        assert!(!artifacts.join("wi-000004-vanished.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_unsafe_item_id_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = checkout(dir.path());
        let artifacts = dir.path().join("artifacts");

        let err = TarArchiver::default()
            .archive(&fetched, &artifacts, &ItemId::new("../escape"))
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::InvalidSource(_)));
        assert!(!dir.path().join("escape-widgets.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_missing_tar_binary_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = checkout(dir.path());
        let archiver = TarArchiver::new(&ToolConfig {
            tar_path: "/nonexistent/tar-binary".to_string(),
            ..ToolConfig::default()
        });

        let err = archiver
            .archive(&fetched, &dir.path().join("artifacts"), &ItemId::new("wi-000002"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Io(_)));
    }
}
