//! ShardRun Core Domain Types
//!
//! This crate contains the pure partition → process → aggregate domain with no
//! dependencies on:
//! - Filesystem or process IO
//! - Network transports
//! - Runtime specifics
//!
//! Workers and schedulers build on these types; everything here is
//! deterministic given its inputs (apart from generated run ids and report
//! timestamps).

pub mod aggregate;
pub mod error;
pub mod ids;
pub mod item;
pub mod report;
pub mod shard;
pub mod status;

// Re-export commonly used types
pub use aggregate::{aggregate, AggregateIssue, Aggregator, GlobalReport, ShardBreakdown};
pub use error::CoreError;
pub use ids::{ItemId, RunId, ShardId};
pub use item::{ingest, ArtifactRef, Locator, Payload, WorkItem};
pub use report::{ShardReport, StatusCounts};
pub use shard::{shard, Manifest, ManifestEntry, Shard, ShardPlan};
pub use status::{ItemStage, ItemStatus, ShardOutcome};
