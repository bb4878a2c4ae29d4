//! Contracts for the external fetch and archival collaborators.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use shardrun_core::{ArtifactRef, ItemId, Locator};
use thiserror::Error;

/// Local copy of a fetched repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    /// Directory holding the fetched content.
    pub path: PathBuf,

    /// Repository name.
    pub name: String,

    /// Fetched revision, if the fetcher could determine it.
    pub revision: Option<String>,
}

/// Tri-state result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Content is available locally.
    Fetched(FetchedArtifact),

    /// Network-class failure; worth re-driving later.
    Transient(String),

    /// Failure that will not go away on retry (not found, permission denied).
    Permanent(String),
}

/// Fetches the content an item points at.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `locator` into `workspace`, a directory owned by this item alone.
    async fn fetch(&self, locator: &Locator, workspace: &Path) -> FetchOutcome;
}

/// Errors raised while packaging an artifact.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to run archiver: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archiver exited with error: {0}")]
    Tool(String),

    #[error("Invalid artifact source: {0}")]
    InvalidSource(String),
}

/// Packages fetched content into a durable artifact.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Package `fetched` into `artifact_dir`, naming the result after `item_id`.
    async fn archive(
        &self,
        fetched: &FetchedArtifact,
        artifact_dir: &Path,
        item_id: &ItemId,
    ) -> Result<ArtifactRef, ArchiveError>;
}
