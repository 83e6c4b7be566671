//! Rows stored by the analytics pipeline and the derived summary shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::StoreResult;

/// Tables written and read by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    /// Append-only event log
    #[serde(rename = "analytics_events")]
    Events,
    /// One row per browsing session
    #[serde(rename = "analytics_sessions")]
    Sessions,
}

impl Table {
    /// Table name as known to the store.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Events => "analytics_events",
            Table::Sessions => "analytics_sessions",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A page was displayed
    PageView,
    /// An element was clicked
    Click,
    /// A scroll-depth milestone was crossed
    Scroll,
    /// Time-on-page tick
    Engagement,
    /// A form was focused, changed or submitted
    Form,
    /// Anything else
    Custom,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::Click => "click",
            EventType::Scroll => "scroll",
            EventType::Engagement => "engagement",
            EventType::Form => "form",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse device class derived from the user agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Tablet => "tablet",
            DeviceType::Mobile => "mobile",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One browsing visit.
///
/// Created on the first page view of a session, bumped on every later page
/// view and finalized once when the tab is hidden or unloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    pub entry_page: String,
    #[serde(default)]
    pub exit_page: Option<String>,
    pub page_count: u32,
    #[serde(default)]
    pub referrer: Option<String>,
    pub device_type: DeviceType,
    pub browser: String,
    pub os: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub is_bounce: Option<bool>,
}

impl SessionRow {
    /// Key column used for lookups and updates.
    pub const KEY: &'static str = "session_id";

    /// Whether the session has been closed.
    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Serialize into a store row.
    pub fn to_row(&self) -> StoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a store row.
    pub fn from_row(row: Value) -> StoreResult<Self> {
        Ok(serde_json::from_value(row)?)
    }
}

/// One discrete tracked action. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    pub event_type: EventType,
    pub event_name: String,
    pub page_url: String,
    #[serde(default)]
    pub referrer: Option<String>,
    pub session_id: String,
    pub user_agent: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    pub device_type: DeviceType,
    pub browser: String,
    pub os: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl EventRow {
    pub fn to_row(&self) -> StoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_row(row: Value) -> StoreResult<Self> {
        Ok(serde_json::from_value(row)?)
    }
}

/// Page views per page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageStat {
    pub page_url: String,
    pub views: u64,
}

/// Sessions per referring source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStat {
    pub source: String,
    pub sessions: u64,
}

/// Sessions per device class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStat {
    pub device_type: DeviceType,
    pub sessions: u64,
    /// Share of all sessions, 0-100
    pub percentage: f64,
}

/// Precomputed statistics over session and event rows.
///
/// Produced by the store's aggregation entry point and refreshed wholesale;
/// consumers never patch it in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationSummary {
    pub total_page_views: u64,
    pub unique_visitors: u64,
    pub total_sessions: u64,
    /// Mean duration of finalized sessions, in seconds
    pub avg_session_duration: f64,
    /// Percentage of finalized sessions that bounced, 0-100
    pub bounce_rate: f64,
    pub top_pages: Vec<PageStat>,
    pub traffic_sources: Vec<SourceStat>,
    pub device_breakdown: Vec<DeviceStat>,
}
