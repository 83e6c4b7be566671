//! Session rows: lazy creation, per-page-view updates, finalization.

use analytics_store::{Clock, DataStore, Filter, SessionRow, StoreError, Table};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionCreation;
use crate::environment::DeviceInfo;
use crate::error::{TelemetryError, TelemetryResult};
use crate::geo::GeoData;
use crate::transport::bounded;

/// What a page view did to the session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageViewOutcome {
    /// First page view: the row was inserted
    Created,
    /// Later page view: `page_count` bumped to the given value
    Updated { page_count: u32 },
}

/// Data needed to open a session row.
#[derive(Debug, Clone)]
pub struct SessionStart<'a> {
    pub session_id: &'a str,
    pub page_url: &'a str,
    pub referrer: Option<&'a str>,
    pub geo: &'a GeoData,
    pub device: &'a DeviceInfo,
}

/// Maintains the single session row per session id.
///
/// No lock or transaction is taken against the store. Under
/// [`SessionCreation::CheckThenInsert`] two first page views racing within
/// one request latency can both insert; page views after that update every
/// row carrying the key, last writer wins.
#[derive(Debug)]
pub struct SessionWriter<S> {
    store: Arc<S>,
    strategy: SessionCreation,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<S: DataStore> SessionWriter<S> {
    pub fn new(
        store: Arc<S>,
        strategy: SessionCreation,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            strategy,
            timeout,
            clock,
        }
    }

    /// Create the session row unless it exists.
    ///
    /// Returns the row that was already there, or `None` if this call
    /// created it. Losing a creation race to a concurrent page view yields
    /// the winner's row.
    pub async fn ensure_session(&self, start: &SessionStart<'_>) -> TelemetryResult<Option<SessionRow>> {
        if let Some(existing) = self.fetch(start.session_id).await? {
            return Ok(Some(existing));
        }
        if self.create(start).await? {
            return Ok(None);
        }
        let winner = self.fetch(start.session_id).await?.ok_or_else(|| {
            TelemetryError::InvalidEvent(format!(
                "session {} vanished after conflicting insert",
                start.session_id
            ))
        })?;
        Ok(Some(winner))
    }

    /// Record a page view: create the row on the first one, otherwise bump
    /// `page_count` and move `exit_page`.
    pub async fn record_page_view(&self, start: &SessionStart<'_>) -> TelemetryResult<PageViewOutcome> {
        let Some(existing) = self.ensure_session(start).await? else {
            return Ok(PageViewOutcome::Created);
        };

        let page_count = existing.page_count.saturating_add(1);
        let patch = json!({
            "page_count": page_count,
            "exit_page": start.page_url,
        });
        bounded(
            "session update",
            self.timeout,
            self.store
                .update(Table::Sessions, SessionRow::KEY, start.session_id, patch),
        )
        .await?;

        tracing::debug!(session_id = %start.session_id, page_count, "Session page view recorded");
        Ok(PageViewOutcome::Updated { page_count })
    }

    /// Close the session: duration since start and the bounce flag.
    ///
    /// Returns the finalized row, or `None` if no row exists yet.
    pub async fn finalize_session(&self, session_id: &str) -> TelemetryResult<Option<SessionRow>> {
        let Some(mut session) = self.fetch(session_id).await? else {
            tracing::debug!(session_id = %session_id, "No session row to finalize");
            return Ok(None);
        };

        let now = self.clock.now();
        let duration_seconds = (now - session.started_at).num_seconds().max(0);
        let is_bounce = session.page_count == 1;

        let patch = json!({
            "ended_at": now,
            "duration_seconds": duration_seconds,
            "is_bounce": is_bounce,
        });
        bounded(
            "session finalize",
            self.timeout,
            self.store
                .update(Table::Sessions, SessionRow::KEY, session_id, patch),
        )
        .await?;

        session.ended_at = Some(now);
        session.duration_seconds = Some(duration_seconds);
        session.is_bounce = Some(is_bounce);
        tracing::debug!(session_id = %session_id, duration_seconds, is_bounce, "Session finalized");
        Ok(Some(session))
    }

    /// Point lookup by session id.
    pub async fn fetch(&self, session_id: &str) -> TelemetryResult<Option<SessionRow>> {
        let filter = Filter::new().eq(SessionRow::KEY, session_id);
        let row = bounded(
            "session lookup",
            self.timeout,
            self.store.select_single(Table::Sessions, &filter),
        )
        .await?;
        row.map(SessionRow::from_row).transpose().map_err(Into::into)
    }

    async fn create(&self, start: &SessionStart<'_>) -> TelemetryResult<bool> {
        let row = SessionRow {
            session_id: start.session_id.to_string(),
            started_at: self.clock.now(),
            ended_at: None,
            duration_seconds: None,
            entry_page: start.page_url.to_string(),
            exit_page: Some(start.page_url.to_string()),
            page_count: 1,
            referrer: start.referrer.map(str::to_string),
            device_type: start.device.device_type,
            browser: start.device.browser.clone(),
            os: start.device.os.clone(),
            country: Some(start.geo.country.clone()),
            city: Some(start.geo.city.clone()),
            is_bounce: None,
        }
        .to_row()?;

        let created = match self.strategy {
            SessionCreation::Upsert => {
                let attempt = bounded(
                    "session insert",
                    self.timeout,
                    self.store
                        .insert_if_absent(Table::Sessions, SessionRow::KEY, row.clone()),
                )
                .await;
                match attempt {
                    Err(TelemetryError::Store(StoreError::Unsupported(_))) => {
                        tracing::debug!("Store has no upsert, falling back to plain insert");
                        self.insert(row).await?
                    }
                    other => other?,
                }
            }
            SessionCreation::CheckThenInsert => self.insert(row).await?,
        };

        if created {
            tracing::debug!(session_id = %start.session_id, "Session created");
        }
        Ok(created)
    }

    async fn insert(&self, row: serde_json::Value) -> TelemetryResult<bool> {
        bounded(
            "session insert",
            self.timeout,
            self.store.insert(Table::Sessions, row),
        )
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use analytics_store::{ManualClock, MemoryStore};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        device: DeviceInfo,
        geo: GeoData,
    }

    impl Fixture {
        fn new(store: MemoryStore) -> Self {
            Self {
                store: Arc::new(store),
                clock: ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
                device: DeviceInfo::resolve(&Environment::new("Mozilla/5.0 (Windows NT 10.0) Chrome/124.0")),
                geo: GeoData::unknown(),
            }
        }

        fn writer(&self, strategy: SessionCreation) -> SessionWriter<MemoryStore> {
            SessionWriter::new(
                Arc::clone(&self.store),
                strategy,
                Duration::from_secs(5),
                Arc::new(self.clock.clone()),
            )
        }

        fn start<'a>(&'a self, page_url: &'a str) -> SessionStart<'a> {
            SessionStart {
                session_id: "session_1_abcdefghi",
                page_url,
                referrer: Some("https://news.example.com/"),
                geo: &self.geo,
                device: &self.device,
            }
        }
    }

    #[tokio::test]
    async fn test_ensure_session_is_idempotent() {
        let fx = Fixture::new(MemoryStore::new());
        let writer = fx.writer(SessionCreation::CheckThenInsert);

        assert!(writer.ensure_session(&fx.start("/home")).await.unwrap().is_none());
        let existing = writer.ensure_session(&fx.start("/about")).await.unwrap().unwrap();
        assert_eq!(existing.entry_page, "/home");

        let sessions = fx.store.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entry_page, "/home");
        assert_eq!(sessions[0].page_count, 1);
        assert_eq!(sessions[0].referrer.as_deref(), Some("https://news.example.com/"));
        assert_eq!(sessions[0].browser, "Chrome");
    }

    #[tokio::test]
    async fn test_record_page_view_counts_pages() {
        let fx = Fixture::new(MemoryStore::new());
        let writer = fx.writer(SessionCreation::CheckThenInsert);

        assert_eq!(writer.record_page_view(&fx.start("/home")).await.unwrap(), PageViewOutcome::Created);
        assert_eq!(
            writer.record_page_view(&fx.start("/services")).await.unwrap(),
            PageViewOutcome::Updated { page_count: 2 }
        );
        assert_eq!(
            writer.record_page_view(&fx.start("/contact")).await.unwrap(),
            PageViewOutcome::Updated { page_count: 3 }
        );

        let session = writer.fetch("session_1_abcdefghi").await.unwrap().unwrap();
        assert_eq!(session.page_count, 3);
        assert_eq!(session.entry_page, "/home");
        assert_eq!(session.exit_page.as_deref(), Some("/contact"));
    }

    #[tokio::test]
    async fn test_finalize_single_page_is_bounce() {
        let fx = Fixture::new(MemoryStore::new());
        let writer = fx.writer(SessionCreation::CheckThenInsert);

        writer.record_page_view(&fx.start("/home")).await.unwrap();
        fx.clock.advance(Duration::from_secs(40));

        let session = writer.finalize_session("session_1_abcdefghi").await.unwrap().unwrap();
        assert_eq!(session.duration_seconds, Some(40));
        assert_eq!(session.is_bounce, Some(true));

        let stored = writer.fetch("session_1_abcdefghi").await.unwrap().unwrap();
        assert!(stored.is_finalized());
        assert_eq!(stored.is_bounce, Some(true));
        assert_eq!(stored.duration_seconds, Some(40));
    }

    #[tokio::test]
    async fn test_finalize_multi_page_is_not_bounce() {
        let fx = Fixture::new(MemoryStore::new());
        let writer = fx.writer(SessionCreation::CheckThenInsert);

        writer.record_page_view(&fx.start("/home")).await.unwrap();
        writer.record_page_view(&fx.start("/about")).await.unwrap();

        let session = writer.finalize_session("session_1_abcdefghi").await.unwrap().unwrap();
        assert_eq!(session.is_bounce, Some(false));
    }

    #[tokio::test]
    async fn test_finalize_missing_session() {
        let fx = Fixture::new(MemoryStore::new());
        let writer = fx.writer(SessionCreation::CheckThenInsert);
        assert!(writer.finalize_session("nope").await.unwrap().is_none());
        assert_eq!(fx.store.call_counts().updates, 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_page_views_check_then_insert() {
        let store = MemoryStore::without_upsert();
        store.set_latency(Duration::from_millis(10));
        let fx = Fixture::new(store);
        let writer = fx.writer(SessionCreation::CheckThenInsert);

        let (first, second) = (fx.start("/home"), fx.start("/home"));
        let (a, b) = tokio::join!(writer.record_page_view(&first), writer.record_page_view(&second));
        assert!(a.is_ok() && b.is_ok());

        // Accepted race: both may observe "absent", never more than one duplicate.
        let rows = fx.store.sessions().await.unwrap();
        assert!(!rows.is_empty() && rows.len() <= 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_page_views_upsert() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(10));
        let fx = Fixture::new(store);
        let writer = fx.writer(SessionCreation::Upsert);

        let (first, second) = (fx.start("/home"), fx.start("/home"));
        let (a, b) = tokio::join!(writer.record_page_view(&first), writer.record_page_view(&second));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, PageViewOutcome::Updated { .. }));
        assert_eq!(outcomes, vec![PageViewOutcome::Created, PageViewOutcome::Updated { page_count: 2 }]);

        let rows = fx.store.sessions().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_count, 2);
    }

    #[tokio::test]
    async fn test_upsert_falls_back_without_store_support() {
        let fx = Fixture::new(MemoryStore::without_upsert());
        let writer = fx.writer(SessionCreation::Upsert);

        assert!(writer.ensure_session(&fx.start("/home")).await.unwrap().is_none());
        assert_eq!(fx.store.sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_propagates_internally() {
        let fx = Fixture::new(MemoryStore::new());
        fx.store.set_fail_selects(true);
        let writer = fx.writer(SessionCreation::CheckThenInsert);

        let result = writer.record_page_view(&fx.start("/home")).await;
        assert!(matches!(result, Err(TelemetryError::Store(_))));
        assert_eq!(fx.store.call_counts().inserts, 0);
    }
}
