//! ShardRun Worker
//!
//! Runs one shard through the per-item pipeline and persists its report.
//! The fetch and archival side effects sit behind the [`Fetcher`] and
//! [`Archiver`] traits; [`GitFetcher`] and [`TarArchiver`] drive the `git`
//! and `tar` CLIs.

pub mod archive;
pub mod collaborator;
pub mod config;
pub mod executor;
pub mod git;
pub mod json_output;
pub mod layout;

pub use archive::TarArchiver;
pub use collaborator::{ArchiveError, Archiver, FetchOutcome, FetchedArtifact, Fetcher};
pub use config::{ToolConfig, WorkerConfig};
pub use executor::Worker;
pub use git::GitFetcher;
pub use layout::{LayoutError, RunLayout};
