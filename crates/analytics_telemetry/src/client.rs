//! The tracker: public capture API composing identity, fingerprint,
//! geolocation, delivery and session lifecycle.

use analytics_store::{Clock, DataStore, EventRow, EventType, SystemClock};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::config::TelemetryConfig;
use crate::environment::{DeviceInfo, Environment};
use crate::error::{TelemetryError, TelemetryResult};
use crate::event::{ElementInfo, EventContext, FormAction, FormInfo, MousePosition, TrackedEvent};
use crate::geo::{GeoData, GeoResolver, GeolocationCache, HttpGeoResolver};
use crate::lifecycle::{PageViewOutcome, SessionStart, SessionWriter};
use crate::session::{MemorySessionStorage, SessionIdentity, SessionStorage};
use crate::transport::Delivery;

/// Scroll-depth milestones, in percent.
pub const SCROLL_MILESTONES: [u8; 4] = [25, 50, 75, 100];

/// Per-page scroll high-water mark and the milestones already emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ScrollTracker {
    max_depth: u8,
    last_milestone: u8,
}

impl ScrollTracker {
    /// Milestones newly crossed by `depth`, in ascending order.
    ///
    /// Only a depth above the recorded maximum can emit, and each milestone
    /// is emitted at most once per page.
    pub(crate) fn record(&mut self, depth: u8) -> Vec<u8> {
        let depth = depth.min(100);
        if depth <= self.max_depth {
            return Vec::new();
        }
        self.max_depth = depth;

        let crossed: Vec<u8> = SCROLL_MILESTONES
            .iter()
            .copied()
            .filter(|m| *m > self.last_milestone && *m <= depth)
            .collect();
        if let Some(&highest) = crossed.last() {
            self.last_milestone = highest;
        }
        crossed
    }

    pub(crate) fn max_depth(&self) -> u8 {
        self.max_depth
    }
}

#[derive(Debug)]
struct PageState {
    path: String,
    started_at: DateTime<Utc>,
    scroll: ScrollTracker,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Events written to the store
    pub events_delivered: u64,
    /// Events lost to store errors or timeouts
    pub events_failed: u64,
    /// Events dropped because tracking was not initialized yet
    pub events_dropped: u64,
}

/// Builder for [`Tracker`].
pub struct TrackerBuilder<S, R> {
    config: TelemetryConfig,
    store: Arc<S>,
    resolver: R,
    storage: Arc<dyn SessionStorage>,
    environment: Environment,
    clock: Arc<dyn Clock>,
    initial_path: String,
}

impl<S: DataStore, R: GeoResolver> TrackerBuilder<S, R> {
    /// Session storage; defaults to a fresh in-memory store (one tab).
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Path of the page the tracker is created on.
    pub fn path(mut self, path: &str) -> Self {
        self.initial_path = path.to_string();
        self
    }

    pub fn build(self) -> Tracker<S, R> {
        let timeout = self.config.delivery_timeout();
        let identity = SessionIdentity::new(
            self.storage,
            &self.config.session_storage_key,
            Arc::clone(&self.clock),
        );
        let page = PageState {
            path: self.initial_path,
            started_at: self.clock.now(),
            scroll: ScrollTracker::default(),
        };

        Tracker {
            delivery: Delivery::new(Arc::clone(&self.store), timeout),
            sessions: SessionWriter::new(
                Arc::clone(&self.store),
                self.config.session_creation,
                timeout,
                Arc::clone(&self.clock),
            ),
            geo: GeolocationCache::new(self.resolver, self.config.geo_timeout()),
            identity,
            environment: RwLock::new(self.environment),
            page: Mutex::new(page),
            clock: self.clock,
            initialized: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            config: self.config,
        }
    }
}

/// Telemetry client for one page load.
///
/// Holds every piece of memoized state (geolocation, session id,
/// initialization flag, page clock, scroll mark) so independent instances
/// never share results. All `track_*` methods swallow their errors after
/// logging them; [`Tracker::try_track`] exposes the typed result.
pub struct Tracker<S, R> {
    config: TelemetryConfig,
    delivery: Delivery<S>,
    sessions: SessionWriter<S>,
    geo: GeolocationCache<R>,
    identity: SessionIdentity,
    environment: RwLock<Environment>,
    page: Mutex<PageState>,
    clock: Arc<dyn Clock>,
    initialized: AtomicBool,
    finalized: AtomicBool,
    dropped: AtomicU64,
}

impl<S: DataStore> Tracker<S, HttpGeoResolver> {
    /// Tracker resolving geolocation over HTTP at `config.geo_endpoint`.
    pub fn with_http_geolocation(
        config: TelemetryConfig,
        store: Arc<S>,
    ) -> TelemetryResult<TrackerBuilder<S, HttpGeoResolver>> {
        config.validate()?;
        let resolver = HttpGeoResolver::new(&config.geo_endpoint, config.geo_timeout())?;
        Ok(Tracker::builder(config, store, resolver))
    }
}

impl<S: DataStore, R: GeoResolver> Tracker<S, R> {
    pub fn builder(config: TelemetryConfig, store: Arc<S>, resolver: R) -> TrackerBuilder<S, R> {
        TrackerBuilder {
            config,
            store,
            resolver,
            storage: Arc::new(MemorySessionStorage::new()),
            environment: Environment::default(),
            clock: Arc::new(SystemClock),
            initial_path: "/".to_string(),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Allow or refuse capture. Calls made while uninitialized are dropped.
    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> &str {
        self.identity.session_id()
    }

    pub async fn geolocation(&self) -> GeoData {
        self.geo.get().await
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo::resolve(&self.environment())
    }

    pub fn environment(&self) -> Environment {
        self.environment
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the environment, e.g. after a viewport resize.
    pub fn set_environment(&self, environment: Environment) {
        *self
            .environment
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = environment;
    }

    pub fn current_path(&self) -> String {
        self.page().path.clone()
    }

    /// Change the current path without emitting anything.
    pub fn set_current_path(&self, path: &str) {
        self.page().path = path.to_string();
    }

    /// Highest scroll depth seen on the current page.
    pub fn max_scroll_depth(&self) -> u8 {
        self.page().scroll.max_depth()
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            events_delivered: self.delivery.delivered_count(),
            events_failed: self.delivery.failed_count(),
            events_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Capture an event. Never fails; errors are logged.
    pub async fn track_event(&self, event: TrackedEvent) {
        let event_type = event.event_type;
        match self.try_track(event).await {
            Ok(()) => {}
            Err(TelemetryError::NotInitialized) => {
                tracing::debug!(event_type = %event_type, "Tracker not initialized, event dropped");
            }
            // Delivery already logged the failure.
            Err(_) => {}
        }
    }

    /// Capture an event and report what happened.
    pub async fn try_track(&self, event: TrackedEvent) -> TelemetryResult<()> {
        if !self.is_initialized() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(TelemetryError::NotInitialized);
        }
        self.delivery.deliver(self.compose(event)).await
    }

    async fn compose(&self, event: TrackedEvent) -> TelemetryResult<EventRow> {
        let geo = self.geo.get().await;
        let environment = self.environment();
        let device = DeviceInfo::resolve(&environment);
        let current_path = self.current_path();

        let context = EventContext {
            session_id: self.identity.session_id(),
            current_path: &current_path,
            environment: &environment,
            device: &device,
            geo: &geo,
            now: self.clock.now(),
        };
        Ok(event.into_row(&context))
    }

    /// New page: reset the page clock and scroll mark, emit `page_view`,
    /// and create or bump the session row.
    pub async fn track_page_view(&self, path: Option<&str>) {
        if let Some(path) = self.begin_page_view(path) {
            self.emit_page_view(&path).await;
        }
    }

    /// Start a new page synchronously and return its path, or `None` when
    /// tracking is not initialized. A page begun here is recorded by
    /// [`emit_page_view`](Self::emit_page_view) even if tracking is switched
    /// off in between.
    pub(crate) fn begin_page_view(&self, path: Option<&str>) -> Option<String> {
        if !self.is_initialized() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Tracker not initialized, page view dropped");
            return None;
        }

        let path = {
            let mut page = self.page();
            if let Some(path) = path {
                page.path = path.to_string();
            }
            page.started_at = self.clock.now();
            page.scroll = ScrollTracker::default();
            page.path.clone()
        };
        self.finalized.store(false, Ordering::SeqCst);
        Some(path)
    }

    pub(crate) async fn emit_page_view(&self, path: &str) {
        let event = TrackedEvent::new(EventType::PageView, "Page View").with_page_url(path);
        // Delivery logs and counts its own failures.
        let (_, session) = tokio::join!(
            self.delivery.deliver(self.compose(event)),
            self.record_session_page_view(path)
        );
        if let Err(e) = session {
            tracing::warn!(error = %e, page = %path, "Session update failed");
        }
    }

    /// The whole session write, lookup and insert or update included, is
    /// bounded by the delivery timeout.
    async fn record_session_page_view(&self, path: &str) -> TelemetryResult<PageViewOutcome> {
        let timeout = self.config.delivery_timeout();
        let write = async {
            let geo = self.geo.get().await;
            let environment = self.environment();
            let device = DeviceInfo::resolve(&environment);
            let start = SessionStart {
                session_id: self.identity.session_id(),
                page_url: path,
                referrer: environment.referrer.as_deref(),
                geo: &geo,
                device: &device,
            };
            self.sessions.record_page_view(&start).await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::Timeout {
                operation: "session page view",
                timeout,
            }),
        }
    }

    /// Emit a `click` event for `element`.
    pub async fn track_click(&self, element: &ElementInfo, position: Option<MousePosition>) {
        let mut event = TrackedEvent::new(EventType::Click, &format!("Click: {}", element.label()))
            .with_element(element);
        event.mouse_position = position;
        self.track_event(event).await;
    }

    /// Emit one `scroll` event per newly crossed milestone.
    pub async fn track_scroll_depth(&self, depth: u8) {
        if !self.is_initialized() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(depth, "Tracker not initialized, scroll depth dropped");
            return;
        }
        let crossed = self.page().scroll.record(depth);
        for milestone in crossed {
            let event = TrackedEvent::new(EventType::Scroll, &format!("Scroll {}%", milestone))
                .with_scroll_depth(milestone);
            self.track_event(event).await;
        }
    }

    /// Emit an `engagement` event with seconds on the current page and the
    /// scroll high-water mark.
    pub async fn track_time_on_page(&self) {
        let (seconds, max_scroll) = {
            let page = self.page();
            let elapsed = (self.clock.now() - page.started_at).num_seconds().max(0) as u64;
            (elapsed, page.scroll.max_depth())
        };
        let event = TrackedEvent::new(EventType::Engagement, "Time on Page")
            .with_time_on_page(seconds)
            .with_property("max_scroll_depth", max_scroll);
        self.track_event(event).await;
    }

    /// Emit a `form` event describing the form, never its values.
    pub async fn track_form_interaction(&self, form: &FormInfo, action: FormAction) {
        let fields: Vec<Value> = form.field_names.iter().cloned().map(Value::from).collect();
        let mut event = TrackedEvent::new(EventType::Form, &format!("Form {}", action.as_str()))
            .with_property("form_action", action.as_str())
            .with_property("form_fields", fields)
            .with_property("form_method", form.method.clone())
            .with_property("form_target", form.action.clone());
        if let Some(id) = &form.id {
            event = event.with_property("form_id", id.clone());
        }
        self.track_event(event).await;
    }

    /// Close the session row. At most once per page view; best-effort.
    ///
    /// A finalize that closed nothing, because the row is not written yet or
    /// the write failed, leaves a later hide or unload free to try again.
    pub async fn finalize_session(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.sessions.finalize_session(self.identity.session_id()).await {
            Ok(Some(session)) => {
                tracing::debug!(session_id = %session.session_id, "Session closed");
            }
            Ok(None) => {
                self.finalized.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                self.finalized.store(false, Ordering::SeqCst);
                tracing::warn!(error = %e, "Session finalization failed");
            }
        }
    }

    fn page(&self) -> MutexGuard<'_, PageState> {
        self.page.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S, R> std::fmt::Debug for Tracker<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("config", &self.config)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
