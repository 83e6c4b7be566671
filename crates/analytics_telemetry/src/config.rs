//! Tracker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{TelemetryError, TelemetryResult};

/// Default geolocation lookup endpoint.
pub const DEFAULT_GEO_ENDPOINT: &str = "https://ipapi.co/json/";

/// Default key under which the session id is kept in session storage.
pub const DEFAULT_SESSION_STORAGE_KEY: &str = "analytics_session_id";

/// How the session row is created on the first page view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCreation {
    /// Point lookup, then insert when absent. Two racing first page views
    /// can both insert; accepted because sessions are single-tab.
    #[default]
    CheckThenInsert,
    /// Store-side "insert if not exists"; never duplicates.
    Upsert,
}

/// Configuration for the [`Tracker`](crate::Tracker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Geolocation lookup URL
    pub geo_endpoint: String,
    /// Hard timeout for the geolocation lookup (milliseconds)
    pub geo_timeout_ms: u64,
    /// Hard timeout for a single event delivery (milliseconds)
    pub delivery_timeout_ms: u64,
    /// Delay between mount and listener attachment (milliseconds)
    pub settle_delay_ms: u64,
    /// Session storage key holding the session id
    pub session_storage_key: String,
    /// Session row creation strategy
    pub session_creation: SessionCreation,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            geo_endpoint: DEFAULT_GEO_ENDPOINT.to_string(),
            geo_timeout_ms: 2000,
            delivery_timeout_ms: 5000,
            settle_delay_ms: 100,
            session_storage_key: DEFAULT_SESSION_STORAGE_KEY.to_string(),
            session_creation: SessionCreation::default(),
        }
    }
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> TelemetryResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject timeouts of zero, which would drop every operation.
    pub fn validate(&self) -> TelemetryResult<()> {
        if self.geo_timeout_ms == 0 {
            return Err(TelemetryError::Config("geo_timeout_ms must be positive".to_string()));
        }
        if self.delivery_timeout_ms == 0 {
            return Err(TelemetryError::Config(
                "delivery_timeout_ms must be positive".to_string(),
            ));
        }
        if self.session_storage_key.is_empty() {
            return Err(TelemetryError::Config(
                "session_storage_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the geolocation endpoint.
    pub fn with_geo_endpoint(mut self, endpoint: &str) -> Self {
        self.geo_endpoint = endpoint.to_string();
        self
    }

    /// Set the geolocation timeout.
    pub fn with_geo_timeout(mut self, timeout: Duration) -> Self {
        self.geo_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the mount settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_session_storage_key(mut self, key: &str) -> Self {
        self.session_storage_key = key.to_string();
        self
    }

    pub fn with_session_creation(mut self, strategy: SessionCreation) -> Self {
        self.session_creation = strategy;
        self
    }

    pub fn geo_timeout(&self) -> Duration {
        Duration::from_millis(self.geo_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
