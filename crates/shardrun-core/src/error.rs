//! Core domain errors.

use thiserror::Error;

/// Core domain errors for ShardRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid run configuration (e.g. a non-positive worker count).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed work item at ingestion or partition time.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid state transition.
    #[error("Invalid state transition for {item}: {from} -> {to}")]
    InvalidStateTransition {
        item: String,
        from: String,
        to: String,
    },

    /// Overlapping item ids or shard reports detected during aggregation.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// One or more shard reports are missing or partial.
    #[error("Incomplete run: {0}")]
    IncompleteRun(String),
}
