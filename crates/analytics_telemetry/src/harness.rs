//! Listener harness: binds a [`Tracker`] to a host page for one mount.
//!
//! The host page is abstracted as an [`EventTarget`]. Mounting returns a
//! [`HarnessHandle`]; disposing or dropping the handle removes every listener
//! the mount attached, cancels a pending settle timer and re-arms the guard.

use analytics_store::DataStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::Tracker;
use crate::event::{ElementInfo, MousePosition};
use crate::geo::GeoResolver;

/// Interaction reported by the host page.
#[derive(Debug, Clone, PartialEq)]
pub enum DomEvent {
    Click {
        element: ElementInfo,
        position: Option<MousePosition>,
    },
    Scroll {
        scroll_top: f64,
        document_height: f64,
        viewport_height: f64,
    },
    VisibilityChange {
        hidden: bool,
    },
    Unload,
}

impl DomEvent {
    pub fn kind(&self) -> ListenerKind {
        match self {
            DomEvent::Click { .. } => ListenerKind::Click,
            DomEvent::Scroll { .. } => ListenerKind::Scroll,
            DomEvent::VisibilityChange { .. } => ListenerKind::Visibility,
            DomEvent::Unload => ListenerKind::Unload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Click,
    /// Passive
    Scroll,
    Visibility,
    Unload,
}

impl ListenerKind {
    pub const ALL: [ListenerKind; 4] = [
        ListenerKind::Click,
        ListenerKind::Scroll,
        ListenerKind::Visibility,
        ListenerKind::Unload,
    ];
}

pub type Listener = Arc<dyn Fn(&DomEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Something listeners can be attached to, such as a document.
pub trait EventTarget: Send + Sync {
    fn add_listener(&self, kind: ListenerKind, listener: Listener) -> ListenerId;

    /// Returns `false` if `id` was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// In-process page that dispatches events synchronously to its listeners.
#[derive(Default)]
pub struct SimulatedPage {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, ListenerKind, Listener)>>,
}

impl SimulatedPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke every listener registered for the event's kind. Returns how
    /// many were invoked.
    pub fn dispatch(&self, event: &DomEvent) -> usize {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .entries()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in &matching {
            listener(event);
        }
        matching.len()
    }

    pub fn listener_count(&self) -> usize {
        self.entries().len()
    }

    pub fn listener_count_for(&self, kind: ListenerKind) -> usize {
        self.entries().iter().filter(|(_, k, _)| *k == kind).count()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(ListenerId, ListenerKind, Listener)>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventTarget for SimulatedPage {
    fn add_listener(&self, kind: ListenerKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, kind, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(existing, _, _)| *existing != id);
        entries.len() != before
    }
}

impl std::fmt::Debug for SimulatedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPage")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Percent scrolled through the document, 0..=100. A document that fits
/// the viewport counts as fully read.
pub fn scroll_percent(scroll_top: f64, document_height: f64, viewport_height: f64) -> u8 {
    let scrollable = document_height - viewport_height;
    if scrollable <= 0.0 {
        return 100;
    }
    // NaN saturates to 0 in the cast.
    (scroll_top / scrollable * 100.0).round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Uninitialized,
    Initializing,
    Active,
    TornDown,
}

#[derive(Debug, Default)]
struct Registrations {
    generation: u64,
    disposed: bool,
    ids: Vec<ListenerId>,
}

struct Shared<S, R> {
    tracker: Arc<Tracker<S, R>>,
    target: Arc<dyn EventTarget>,
    mounted: AtomicBool,
    registrations: Mutex<Registrations>,
    state: watch::Sender<HarnessState>,
}

impl<S, R> Shared<S, R>
where
    S: DataStore + 'static,
    R: GeoResolver + 'static,
{
    fn registrations(&self) -> MutexGuard<'_, Registrations> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach the listeners and issue the first page view, unless the mount
    /// was disposed or replaced while settling. The page view runs as its
    /// own task so a later teardown cannot cancel it.
    fn activate(&self, generation: u64, runtime: &Handle) {
        let mut registrations = self.registrations();
        if registrations.disposed || registrations.generation != generation {
            return;
        }
        for kind in ListenerKind::ALL {
            let listener = listener(Arc::clone(&self.tracker), runtime.clone());
            registrations.ids.push(self.target.add_listener(kind, listener));
        }
        self.tracker.set_initialized(true);
        self.state.send_replace(HarnessState::Active);
        tracing::info!(path = %self.tracker.current_path(), "Listener harness active");

        if let Some(path) = self.tracker.begin_page_view(None) {
            let tracker = Arc::clone(&self.tracker);
            runtime.spawn(async move { tracker.emit_page_view(&path).await });
        }
    }

    fn teardown(&self) {
        let removed = {
            let mut registrations = self.registrations();
            registrations.disposed = true;
            self.tracker.set_initialized(false);
            std::mem::take(&mut registrations.ids)
                .into_iter()
                .filter(|id| self.target.remove_listener(*id))
                .count()
        };
        self.mounted.store(false, Ordering::SeqCst);
        self.state.send_replace(HarnessState::TornDown);
        tracing::info!(removed, "Listener harness torn down");
    }
}

fn listener<S, R>(tracker: Arc<Tracker<S, R>>, runtime: Handle) -> Listener
where
    S: DataStore + 'static,
    R: GeoResolver + 'static,
{
    Arc::new(move |event: &DomEvent| {
        let tracker = Arc::clone(&tracker);
        let event = event.clone();
        // Each interaction runs in its own task; a failure in one cannot
        // reach the page or later interactions.
        runtime.spawn(async move { respond(&tracker, event).await });
    })
}

async fn respond<S: DataStore, R: GeoResolver>(tracker: &Tracker<S, R>, event: DomEvent) {
    match event {
        DomEvent::Click { element, position } => tracker.track_click(&element, position).await,
        DomEvent::Scroll {
            scroll_top,
            document_height,
            viewport_height,
        } => {
            let depth = scroll_percent(scroll_top, document_height, viewport_height);
            tracker.track_scroll_depth(depth).await;
        }
        DomEvent::VisibilityChange { hidden: false } => {}
        DomEvent::VisibilityChange { hidden: true } | DomEvent::Unload => {
            tracker.track_time_on_page().await;
            tracker.finalize_session().await;
        }
    }
}

/// Attaches a tracker's listeners to a page, at most once at a time.
pub struct ListenerHarness<S, R> {
    shared: Arc<Shared<S, R>>,
}

impl<S, R> ListenerHarness<S, R>
where
    S: DataStore + 'static,
    R: GeoResolver + 'static,
{
    pub fn new(tracker: Arc<Tracker<S, R>>, target: Arc<dyn EventTarget>) -> Self {
        let (state, _) = watch::channel(HarnessState::Uninitialized);
        Self {
            shared: Arc::new(Shared {
                tracker,
                target,
                mounted: AtomicBool::new(false),
                registrations: Mutex::new(Registrations::default()),
                state,
            }),
        }
    }

    pub fn tracker(&self) -> &Arc<Tracker<S, R>> {
        &self.shared.tracker
    }

    pub fn state(&self) -> HarnessState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HarnessState> {
        self.shared.state.subscribe()
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.mounted.load(Ordering::SeqCst)
    }

    /// Start the mount: after the settle delay, attach listeners, mark the
    /// tracker initialized and record the first page view.
    ///
    /// Returns `None` if a mount is already live or no tokio runtime is
    /// running.
    pub fn mount(&self) -> Option<HarnessHandle<S, R>> {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!(error = %e, "No async runtime, listener harness not mounted");
                return None;
            }
        };
        if self.shared.mounted.swap(true, Ordering::SeqCst) {
            tracing::debug!("Listener harness already mounted");
            return None;
        }

        let generation = {
            let mut registrations = self.shared.registrations();
            registrations.generation += 1;
            registrations.disposed = false;
            registrations.ids.clear();
            registrations.generation
        };
        self.shared.state.send_replace(HarnessState::Initializing);

        let shared = Arc::clone(&self.shared);
        let delay = shared.tracker.config().settle_delay();
        let listener_runtime = runtime.clone();
        let settle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.activate(generation, &listener_runtime);
        });

        tracing::debug!(settle_delay = ?delay, "Listener harness mounting");
        Some(HarnessHandle {
            shared: Arc::clone(&self.shared),
            settle: Some(settle),
        })
    }
}

impl<S, R> std::fmt::Debug for ListenerHarness<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHarness")
            .field("state", &*self.shared.state.borrow())
            .field("mounted", &self.shared.mounted.load(Ordering::Relaxed))
            .finish()
    }
}

/// A live mount. Dropping it tears the mount down.
pub struct HarnessHandle<S: DataStore + 'static, R: GeoResolver + 'static> {
    shared: Arc<Shared<S, R>>,
    settle: Option<JoinHandle<()>>,
}

impl<S: DataStore + 'static, R: GeoResolver + 'static> HarnessHandle<S, R> {
    /// Client-side route change: re-run page-view capture for `path`
    /// without touching the listeners.
    pub async fn navigate(&self, path: &str) {
        if *self.shared.state.borrow() != HarnessState::Active {
            tracing::debug!(path = %path, "Navigation before activation ignored");
            return;
        }
        self.shared.state.send_replace(HarnessState::Initializing);
        self.shared.tracker.track_page_view(Some(path)).await;
        self.shared.state.send_if_modified(|state| {
            if *state == HarnessState::Initializing {
                *state = HarnessState::Active;
                true
            } else {
                false
            }
        });
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle.abort();
            self.shared.teardown();
        }
    }
}

impl<S: DataStore + 'static, R: GeoResolver + 'static> Drop for HarnessHandle<S, R> {
    fn drop(&mut self) {
        self.release();
    }
}
