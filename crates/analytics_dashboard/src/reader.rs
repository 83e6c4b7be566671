//! Aggregation reader: pulls the summary and the live breakdowns.

use analytics_store::{
    AggregationSummary, Clock, DataStore, EventRow, EventType, Filter, SystemClock, Table,
};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::DashboardConfig;
use crate::error::{DashboardError, DashboardResult};

/// Derived funnel stages after page views, as fractions of page views.
pub const FUNNEL_FRACTIONS: [(&str, f64); 3] = [
    ("Engagement", 0.6),
    ("Contact Forms", 0.15),
    ("Conversions", 0.08),
];

/// One funnel stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStage {
    pub name: String,
    pub value: u64,
    /// `true` when the value is a fixed-ratio approximation rather than a
    /// measurement. Presentation must mark such stages.
    pub estimated: bool,
}

/// Page Views → Engagement → Contact Forms → Conversions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Funnel {
    pub stages: Vec<FunnelStage>,
}

impl Funnel {
    /// Funnel for `page_views`. Only the first stage is measured.
    pub fn estimate(page_views: u64) -> Self {
        let mut stages = vec![FunnelStage {
            name: "Page Views".to_string(),
            value: page_views,
            estimated: false,
        }];
        stages.extend(FUNNEL_FRACTIONS.iter().map(|(name, fraction)| FunnelStage {
            name: name.to_string(),
            value: (page_views as f64 * fraction).round() as u64,
            estimated: true,
        }));
        Self { stages }
    }

    pub fn measured(&self) -> impl Iterator<Item = &FunnelStage> {
        self.stages.iter().filter(|stage| !stage.estimated)
    }
}

/// Everything a dashboard renders from one pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    pub summary: AggregationSummary,
    /// Today's page views by local hour
    pub hourly: [u64; 24],
    pub active_sessions: u64,
    pub funnel: Funnel,
    pub fetched_at: DateTime<Utc>,
}

/// Reads dashboard data and publishes the latest pull.
///
/// The published value is `None` until a pull succeeds and again after any
/// pull fails, so consumers can tell "no data" from "zero traffic".
pub struct AggregationReader<S> {
    store: Arc<S>,
    config: DashboardConfig,
    clock: Arc<dyn Clock>,
    latest: watch::Sender<Option<DashboardData>>,
}

impl<S: DataStore> AggregationReader<S> {
    pub fn new(store: Arc<S>, config: DashboardConfig) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            latest,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    /// Receiver of every published pull.
    pub fn subscribe(&self) -> watch::Receiver<Option<DashboardData>> {
        self.latest.subscribe()
    }

    pub fn latest(&self) -> Option<DashboardData> {
        self.latest.borrow().clone()
    }

    /// Pull, publish and return the dashboard data. Never fails: a pull
    /// that errors or outlives `fetch_timeout` publishes and returns `None`.
    pub async fn fetch_summary(&self) -> Option<DashboardData> {
        let timeout = self.config.fetch_timeout();
        let result = tokio::time::timeout(timeout, self.try_fetch())
            .await
            .unwrap_or(Err(DashboardError::Timeout(timeout)));
        let data = match result {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!(error = %e, "Dashboard data unavailable");
                None
            }
        };
        self.latest.send_replace(data.clone());
        data
    }

    /// Pull the dashboard data without publishing it.
    pub async fn try_fetch(&self) -> DashboardResult<DashboardData> {
        let now = self.clock.now();
        let offset = self.config.utc_offset()?;
        let midnight = local_midnight(now, offset)?;
        let since = now - ChronoDuration::days(i64::from(self.config.summary_window_days));
        let active_since = now - to_chrono(self.config.active_window())?;

        let today = Filter::new()
            .eq("event_type", EventType::PageView.as_str())
            .gte("created_at", rfc3339(midnight));
        let recent = Filter::new().gte("created_at", rfc3339(active_since));

        let (mut summary, today_rows, recent_rows) = tokio::try_join!(
            self.store.aggregate(since),
            self.store.select(Table::Events, &today),
            self.store.select(Table::Events, &recent),
        )?;
        summary.top_pages.truncate(self.config.top_pages_limit);

        let today_events = parse_events(today_rows)?;
        let recent_events = parse_events(recent_rows)?;

        let data = DashboardData {
            hourly: hourly_breakdown(&today_events, offset),
            active_sessions: active_sessions(&recent_events),
            funnel: Funnel::estimate(summary.total_page_views),
            summary,
            fetched_at: now,
        };
        tracing::debug!(
            page_views = data.summary.total_page_views,
            active_sessions = data.active_sessions,
            "Dashboard data fetched"
        );
        Ok(data)
    }
}

impl<S> std::fmt::Debug for AggregationReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationReader")
            .field("config", &self.config)
            .field("has_data", &self.latest.borrow().is_some())
            .finish_non_exhaustive()
    }
}

/// Page views bucketed by hour in `offset`.
pub fn hourly_breakdown(events: &[EventRow], offset: FixedOffset) -> [u64; 24] {
    let mut hours = [0u64; 24];
    for event in events.iter().filter(|e| e.event_type == EventType::PageView) {
        let hour = event.created_at.with_timezone(&offset).hour() as usize;
        hours[hour] += 1;
    }
    hours
}

/// Distinct sessions among `events`.
pub fn active_sessions(events: &[EventRow]) -> u64 {
    events
        .iter()
        .map(|e| e.session_id.as_str())
        .collect::<HashSet<_>>()
        .len() as u64
}

/// Start of the local day containing `now`, in UTC.
pub fn local_midnight(now: DateTime<Utc>, offset: FixedOffset) -> DashboardResult<DateTime<Utc>> {
    let midnight = now
        .with_timezone(&offset)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| DashboardError::Config("invalid local midnight".to_string()))?;
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| DashboardError::Config("ambiguous local midnight".to_string()))
}

fn to_chrono(duration: std::time::Duration) -> DashboardResult<ChronoDuration> {
    ChronoDuration::from_std(duration)
        .map_err(|e| DashboardError::Config(format!("window out of range: {}", e)))
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_events(rows: Vec<serde_json::Value>) -> DashboardResult<Vec<EventRow>> {
    rows.into_iter()
        .map(|row| EventRow::from_row(row).map_err(DashboardError::from))
        .collect()
}
