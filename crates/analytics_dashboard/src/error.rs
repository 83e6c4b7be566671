//! Error types for the read side.

use analytics_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while reading dashboard data.
#[derive(Debug, Error)]
pub enum DashboardError {
    /// The data store failed the query
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to parse configuration
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The pull did not finish in time
    #[error("Dashboard fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for dashboard operations.
pub type DashboardResult<T> = Result<T, DashboardError>;
