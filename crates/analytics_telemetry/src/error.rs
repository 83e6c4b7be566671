//! Error types for the telemetry pipeline.
//!
//! None of these reach the host application: public tracking entry points
//! log them and return normally.

use std::time::Duration;

use analytics_store::StoreError;
use thiserror::Error;

/// Errors that can occur while capturing or delivering telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to serialize an event or session row
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The data store rejected or failed the operation
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The operation did not finish in time
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Geolocation lookup failed
    #[error("Geolocation error: {0}")]
    Geolocation(String),

    /// Session storage is blocked or disabled
    #[error("Session storage unavailable: {0}")]
    Storage(String),

    /// Tracking was requested before the harness finished setup
    #[error("Tracker is not initialized")]
    NotInitialized,

    /// Invalid event data
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
