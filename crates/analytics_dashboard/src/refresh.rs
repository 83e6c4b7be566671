//! Realtime refresh: re-pulls dashboard data on store changes, with a
//! periodic fallback.

use analytics_store::{DataStore, Notification, Subscription, Table};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::reader::AggregationReader;

/// Link state shown on the dashboard badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Every change notification channel is open
    Connected,
    /// A refresh is in flight
    Syncing,
    /// At least one notification channel is closed; only polling runs
    Disconnected,
}

/// Drives an [`AggregationReader`] from change notifications and a timer.
///
/// A notification arms a refresh `debounce` later; notifications arriving
/// before it fires are folded into that one refresh. Independently, the
/// reader is polled every `poll_interval`, which also re-subscribes any
/// closed notification channel.
pub struct RefreshController<S> {
    reader: Arc<AggregationReader<S>>,
}

impl<S: DataStore + 'static> RefreshController<S> {
    pub fn new(reader: Arc<AggregationReader<S>>) -> Self {
        Self { reader }
    }

    /// Spawn the refresh loop. The first pull happens immediately.
    pub fn start(self) -> RefreshHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Syncing);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(self.reader, state_tx, shutdown_rx));
        RefreshHandle {
            state: state_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Running refresh loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct RefreshHandle {
    state: watch::Receiver<ConnectionState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the loop and wait for it to drop its subscriptions.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Refresh task ended abnormally");
            }
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Change notification channels for the watched tables. A closed channel
/// is held as `None` until the next reconnect.
struct Channels {
    events: Option<Subscription>,
    sessions: Option<Subscription>,
}

impl Channels {
    fn open<S: DataStore>(store: &S) -> Self {
        let mut channels = Self {
            events: None,
            sessions: None,
        };
        channels.reconnect(store);
        channels
    }

    /// Re-subscribe every closed channel. A subscription that comes back
    /// already closed is not kept.
    fn reconnect<S: DataStore>(&mut self, store: &S) {
        for (slot, table) in [(&mut self.events, Table::Events), (&mut self.sessions, Table::Sessions)] {
            if slot.as_ref().is_some_and(|subscription| !subscription.is_closed()) {
                continue;
            }
            let subscription = store.subscribe(table);
            if subscription.is_closed() {
                tracing::debug!(table = %table, "Change notifications still unavailable");
                *slot = None;
            } else {
                *slot = Some(subscription);
            }
        }
    }

    fn state(&self) -> ConnectionState {
        let open = |slot: &Option<Subscription>| slot.as_ref().is_some_and(|s| !s.is_closed());
        if open(&self.events) && open(&self.sessions) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Next signal on `slot`; pends forever once the channel is gone. A channel
/// that closes is cleared and reported as `None`.
async fn next(slot: &mut Option<Subscription>) -> Option<Notification> {
    let Some(subscription) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let notification = subscription.recv().await;
    if notification.is_none() {
        tracing::warn!(table = %subscription.table(), "Change notification channel closed");
        *slot = None;
    }
    notification
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run<S: DataStore + 'static>(
    reader: Arc<AggregationReader<S>>,
    state: watch::Sender<ConnectionState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let debounce = reader.config().debounce();
    let mut poll = tokio::time::interval(reader.config().poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut channels = Channels::open(reader.store().as_ref());
    let mut pending: Option<Instant> = None;
    tracing::debug!(?debounce, "Refresh loop started");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = poll.tick() => {
                channels.reconnect(reader.store().as_ref());
                pending = None;
                if !refresh(&reader, &state, channels.state(), &mut shutdown).await {
                    break;
                }
            }
            _ = until(pending) => {
                pending = None;
                if !refresh(&reader, &state, channels.state(), &mut shutdown).await {
                    break;
                }
            }
            notification = next(&mut channels.events) => {
                on_notification(notification, &mut pending, debounce, &state, &channels);
            }
            notification = next(&mut channels.sessions) => {
                on_notification(notification, &mut pending, debounce, &state, &channels);
            }
        }
    }

    state.send_replace(ConnectionState::Disconnected);
    tracing::debug!("Refresh loop stopped");
}

fn on_notification(
    notification: Option<Notification>,
    pending: &mut Option<Instant>,
    debounce: Duration,
    state: &watch::Sender<ConnectionState>,
    channels: &Channels,
) {
    match notification {
        Some(Notification::Insert(change)) => {
            tracing::trace!(table = %change.table, "Change notification");
            pending.get_or_insert_with(|| Instant::now() + debounce);
        }
        Some(Notification::Missed(missed)) => {
            tracing::debug!(missed, "Change notifications missed");
            pending.get_or_insert_with(|| Instant::now() + debounce);
        }
        None => {
            state.send_replace(channels.state());
        }
    }
}

/// One pull, abandoned if shutdown arrives first. Returns `false` on
/// shutdown.
async fn refresh<S: DataStore>(
    reader: &AggregationReader<S>,
    state: &watch::Sender<ConnectionState>,
    link: ConnectionState,
    shutdown: &mut oneshot::Receiver<()>,
) -> bool {
    state.send_replace(ConnectionState::Syncing);
    tokio::select! {
        _ = shutdown => return false,
        _ = reader.fetch_summary() => {}
    }
    state.send_replace(link);
    true
}
