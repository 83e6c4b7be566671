//! Visitor Telemetry
//!
//! Capture side of the site analytics pipeline. A [`Tracker`] lives for one
//! page load and records page views, clicks, scroll milestones, time on page
//! and form interactions into a [`DataStore`](analytics_store::DataStore),
//! while keeping one session row per browsing context up to date.
//!
//! Capture is best-effort: no `track_*` call ever returns an error to its
//! caller. Failures are logged through `tracing` and counted in
//! [`Tracker::stats`]; [`Tracker::try_track`] exposes the typed result.
//!
//! # Example
//!
//! ```rust,no_run
//! use analytics_store::MemoryStore;
//! use analytics_telemetry::{Environment, ListenerHarness, SimulatedPage, TelemetryConfig, Tracker};
//! use std::sync::Arc;
//!
//! # async fn run() -> analytics_telemetry::TelemetryResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! let tracker = Tracker::with_http_geolocation(TelemetryConfig::new(), store)?
//!     .environment(Environment::new("Mozilla/5.0 ...").with_screen(1920, 1080))
//!     .path("/home")
//!     .build();
//!
//! let page = Arc::new(SimulatedPage::new());
//! let harness = ListenerHarness::new(Arc::new(tracker), page);
//! let handle = harness.mount();
//! // ... later, on unmount
//! drop(handle);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`client`] - The `Tracker` and its builder
//! - [`environment`] - Device, browser and OS classification
//! - [`geo`] - Geolocation lookup and per-tracker cache
//! - [`harness`] - Page listener attachment and teardown
//! - [`lifecycle`] - Session row creation, updates and finalization
//! - [`logging`] - Subscriber setup

pub mod client;
mod config;
pub mod environment;
mod error;
mod event;
pub mod geo;
pub mod harness;
pub mod lifecycle;
pub mod logging;
mod session;
mod transport;

pub use client::{Tracker, TrackerBuilder, TrackerStats, SCROLL_MILESTONES};
pub use config::{SessionCreation, TelemetryConfig, DEFAULT_GEO_ENDPOINT, DEFAULT_SESSION_STORAGE_KEY};
pub use environment::{DeviceInfo, Environment};
pub use error::{TelemetryError, TelemetryResult};
pub use event::{ElementInfo, FormAction, FormInfo, MousePosition, TrackedEvent, MAX_ELEMENT_TEXT};
pub use geo::{GeoData, GeoResolver, GeolocationCache, HttpGeoResolver};
pub use harness::{
    DomEvent, EventTarget, HarnessHandle, HarnessState, Listener, ListenerHarness, ListenerId,
    ListenerKind, SimulatedPage,
};
pub use lifecycle::{PageViewOutcome, SessionStart, SessionWriter};
pub use session::{mint_session_id, BlockedSessionStorage, MemorySessionStorage, SessionIdentity, SessionStorage};
pub use transport::Delivery;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::geo::tests::{oslo, FakeResolver};
    use analytics_store::{EventType, ManualClock, MemoryStore};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

    #[tokio::test(start_paused = true)]
    async fn test_full_visit_flow() {
        logging::init_test();

        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap());
        let tab = MemorySessionStorage::new();
        let tracker = Tracker::builder(TelemetryConfig::new(), Arc::clone(&store), FakeResolver::ok(oslo()))
            .storage(Arc::new(tab.clone()))
            .environment(Environment::new(IPHONE).with_screen(390, 844).with_viewport(390, 664))
            .clock(Arc::new(clock.clone()))
            .path("/home")
            .build();
        let page = Arc::new(SimulatedPage::new());
        let harness = ListenerHarness::new(Arc::new(tracker), page.clone());

        let handle = harness.mount().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        clock.advance(Duration::from_secs(3));
        handle.navigate("/services").await;
        page.dispatch(&DomEvent::Scroll {
            scroll_top: 1500.0,
            document_height: 2664.0,
            viewport_height: 664.0,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        clock.advance(Duration::from_secs(9));
        page.dispatch(&DomEvent::Unload);
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(handle);

        let sessions = store.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.session_id, tab.get(DEFAULT_SESSION_STORAGE_KEY).unwrap().unwrap());
        assert_eq!(session.entry_page, "/home");
        assert_eq!(session.exit_page.as_deref(), Some("/services"));
        assert_eq!(session.page_count, 2);
        assert_eq!(session.duration_seconds, Some(12));
        assert_eq!(session.is_bounce, Some(false));
        assert_eq!(session.device_type, analytics_store::DeviceType::Mobile);
        assert_eq!(session.country.as_deref(), Some("Norway"));

        let events = store.events().await.unwrap();
        let page_views: Vec<&str> = events
            .iter()
            .filter(|e| e.event_type == EventType::PageView)
            .map(|e| e.page_url.as_str())
            .collect();
        assert_eq!(page_views, vec!["/home", "/services"]);

        let scrolls = events.iter().filter(|e| e.event_type == EventType::Scroll).count();
        assert_eq!(scrolls, 3);
        assert!(events.iter().all(|e| e.session_id == session.session_id));
    }

    #[tokio::test]
    async fn test_geolocation_failure_still_delivers() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Tracker::builder(TelemetryConfig::new(), Arc::clone(&store), FakeResolver::failing()).build();
        tracker.set_initialized(true);

        tracker.track_page_view(Some("/")).await;

        let events = store.events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].country.as_deref(), Some("Unknown"));
        assert_eq!(events[0].city.as_deref(), Some("Unknown"));
        assert_eq!(store.sessions().await.unwrap()[0].country.as_deref(), Some("Unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_geolocation_bounded() {
        let store = Arc::new(MemoryStore::new());
        let config = TelemetryConfig::new().with_geo_timeout(Duration::from_secs(2));
        let tracker = Tracker::builder(config, Arc::clone(&store), FakeResolver::slow(Duration::from_secs(30))).build();
        tracker.set_initialized(true);

        let started = tokio::time::Instant::now();
        tracker.track_event(TrackedEvent::custom("first")).await;
        assert!(started.elapsed() < Duration::from_secs(3));

        let events = store.events().await.unwrap();
        assert_eq!(events[0].country.as_deref(), Some("Unknown"));
    }

    #[tokio::test]
    async fn test_second_page_load_in_same_tab_reuses_session() {
        let store = Arc::new(MemoryStore::new());
        let tab = MemorySessionStorage::new();
        let load = |path: &str| {
            let tracker = Tracker::builder(TelemetryConfig::new(), Arc::clone(&store), FakeResolver::ok(oslo()))
                .storage(Arc::new(tab.clone()))
                .path(path)
                .build();
            tracker.set_initialized(true);
            tracker
        };

        let first = load("/home");
        first.track_page_view(None).await;
        let second = load("/about");
        second.track_page_view(None).await;

        assert_eq!(first.session_id(), second.session_id());
        let sessions = store.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].page_count, 2);
    }
}
