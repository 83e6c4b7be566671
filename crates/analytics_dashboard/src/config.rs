//! Dashboard configuration.

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DashboardError, DashboardResult};

/// Configuration for the [`AggregationReader`](crate::AggregationReader) and
/// [`RefreshController`](crate::RefreshController).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Delay between the first change notification and the refresh it
    /// triggers (milliseconds)
    pub debounce_ms: u64,
    /// Fallback refresh interval (seconds)
    pub poll_interval_secs: u64,
    /// A session is active if it produced an event this recently (seconds)
    pub active_window_secs: u64,
    /// Offset of the dashboard's local time from UTC (minutes)
    pub utc_offset_minutes: i32,
    /// Days covered by the summary
    pub summary_window_days: u32,
    /// Entries kept in `top_pages`
    pub top_pages_limit: usize,
    /// Hard timeout for one pull (milliseconds)
    pub fetch_timeout_ms: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            poll_interval_secs: 30,
            active_window_secs: 300,
            utc_offset_minutes: 0,
            summary_window_days: 30,
            top_pages_limit: 10,
            fetch_timeout_ms: 5000,
        }
    }
}

impl DashboardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> DashboardResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DashboardResult<()> {
        if self.poll_interval_secs == 0 {
            return Err(DashboardError::Config(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(DashboardError::Config(
                "fetch_timeout_ms must be positive".to_string(),
            ));
        }
        if self.summary_window_days == 0 {
            return Err(DashboardError::Config(
                "summary_window_days must be positive".to_string(),
            ));
        }
        self.utc_offset()?;
        Ok(())
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs();
        self
    }

    pub fn with_active_window(mut self, window: Duration) -> Self {
        self.active_window_secs = window.as_secs();
        self
    }

    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    pub fn with_summary_window_days(mut self, days: u32) -> Self {
        self.summary_window_days = days;
        self
    }

    pub fn with_top_pages_limit(mut self, limit: usize) -> Self {
        self.top_pages_limit = limit;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// The local time zone as a fixed offset.
    pub fn utc_offset(&self) -> DashboardResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            DashboardError::Config(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })
    }
}
