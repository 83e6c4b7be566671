//! Delivery of event records to the data store.
//!
//! Best-effort, fire-and-forget: each write races a timeout, failures are
//! logged and counted, nothing is retried or queued.

use analytics_store::{DataStore, EventRow, StoreResult, Table};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{TelemetryError, TelemetryResult};

/// Race `operation` against `timeout`. On timeout the operation is dropped
/// and its eventual result discarded.
pub(crate) async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    future: impl Future<Output = StoreResult<T>>,
) -> TelemetryResult<T> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TelemetryError::Timeout { operation, timeout }),
    }
}

/// Writes event records to the `analytics_events` table.
#[derive(Debug)]
pub struct Delivery<S> {
    store: Arc<S>,
    timeout: Duration,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl<S: DataStore> Delivery<S> {
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Compose and write one event, all within the delivery timeout.
    ///
    /// `compose` covers the enrichment work (geolocation included) so that
    /// the caller never waits longer than the timeout in total.
    pub async fn deliver<F>(&self, compose: F) -> TelemetryResult<()>
    where
        F: Future<Output = TelemetryResult<EventRow>>,
    {
        let attempt = async {
            let event = compose.await?;
            let row = event.to_row()?;
            self.store.insert(Table::Events, row).await?;
            tracing::debug!(event_type = %event.event_type, session_id = %event.session_id, "Event delivered");
            Ok::<(), TelemetryError>(())
        };

        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::Timeout {
                operation: "event delivery",
                timeout: self.timeout,
            }),
        };

        match &result {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TelemetryError::NotInitialized) => {}
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Event delivery failed, dropping event");
            }
        }
        result
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
