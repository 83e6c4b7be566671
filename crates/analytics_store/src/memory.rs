//! In-memory data store with fault injection.
//!
//! Behaves like the hosted store as far as the pipeline can observe:
//! unconditional single-row writes, no transactions, insert notifications
//! per table and a server-side aggregation routine. Faults and latency can be
//! injected to exercise timeout and silent-failure paths.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use crate::aggregate::summarize;
use crate::data_store::DataStore;
use crate::error::{StoreError, StoreResult};
use crate::filter::Filter;
use crate::model::{AggregationSummary, EventRow, SessionRow, Table};
use crate::subscription::{ChangeEvent, Subscription};

/// Capacity of each table's notification channel.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Faults {
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
    fail_selects: AtomicBool,
    fail_aggregate: AtomicBool,
    latency_ms: AtomicU64,
}

/// Number of calls per operation, for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub inserts: u64,
    pub updates: u64,
    pub selects: u64,
    pub aggregates: u64,
}

#[derive(Debug, Default)]
struct Counters {
    inserts: AtomicU64,
    updates: AtomicU64,
    selects: AtomicU64,
    aggregates: AtomicU64,
}

/// A [`DataStore`] holding rows in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, Vec<Value>>>,
    channels: Mutex<HashMap<Table, broadcast::Sender<ChangeEvent>>>,
    supports_upsert: bool,
    faults: Faults,
    counters: Counters,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store that offers `insert_if_absent`.
    pub fn new() -> Self {
        let channels = [Table::Events, Table::Sessions]
            .into_iter()
            .map(|table| (table, broadcast::channel(CHANNEL_CAPACITY).0))
            .collect();
        Self {
            tables: RwLock::new(HashMap::new()),
            channels: Mutex::new(channels),
            supports_upsert: true,
            faults: Faults::default(),
            counters: Counters::default(),
        }
    }

    /// Create an empty store without the upsert primitive.
    pub fn without_upsert() -> Self {
        Self {
            supports_upsert: false,
            ..Self::new()
        }
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.faults.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.faults.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_selects(&self, fail: bool) {
        self.faults.fail_selects.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_aggregate(&self, fail: bool) {
        self.faults.fail_aggregate.store(fail, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Close every notification channel. Existing subscribers observe a
    /// disconnect; later subscriptions are closed from the start.
    pub fn disconnect(&self) {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        tracing::debug!("Memory store notification channels closed");
    }

    pub fn call_counts(&self) -> CallCounts {
        CallCounts {
            inserts: self.counters.inserts.load(Ordering::SeqCst),
            updates: self.counters.updates.load(Ordering::SeqCst),
            selects: self.counters.selects.load(Ordering::SeqCst),
            aggregates: self.counters.aggregates.load(Ordering::SeqCst),
        }
    }

    /// Raw rows of a table.
    pub async fn rows(&self, table: Table) -> Vec<Value> {
        self.tables
            .read()
            .await
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn sessions(&self) -> StoreResult<Vec<SessionRow>> {
        self.rows(Table::Sessions)
            .await
            .into_iter()
            .map(SessionRow::from_row)
            .collect()
    }

    pub async fn events(&self) -> StoreResult<Vec<EventRow>> {
        self.rows(Table::Events)
            .await
            .into_iter()
            .map(EventRow::from_row)
            .collect()
    }

    async fn simulate_network(&self) {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn check(&self, flag: &AtomicBool, operation: &'static str, table: Table) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                operation,
                table,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn notify(&self, table: Table, row: &Value) {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = channels.get(&table) {
            // No receivers is fine.
            let _ = sender.send(ChangeEvent { table, row: row.clone() });
        }
    }
}

impl DataStore for MemoryStore {
    async fn insert(&self, table: Table, row: Value) -> StoreResult<()> {
        self.counters.inserts.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await;
        self.check(&self.faults.fail_inserts, "insert", table)?;

        self.tables
            .write()
            .await
            .entry(table)
            .or_default()
            .push(row.clone());
        self.notify(table, &row);
        Ok(())
    }

    async fn insert_if_absent(&self, table: Table, key_column: &str, row: Value) -> StoreResult<bool> {
        if !self.supports_upsert {
            return Err(StoreError::Unsupported("insert_if_absent"));
        }
        self.counters.inserts.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await;
        self.check(&self.faults.fail_inserts, "insert", table)?;

        let key = row
            .get(key_column)
            .cloned()
            .ok_or_else(|| StoreError::MissingKey(key_column.to_string()))?;

        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();
        if rows.iter().any(|existing| existing.get(key_column) == Some(&key)) {
            return Ok(false);
        }
        rows.push(row.clone());
        drop(tables);

        self.notify(table, &row);
        Ok(true)
    }

    async fn update(
        &self,
        table: Table,
        key_column: &str,
        key_value: &str,
        patch: Value,
    ) -> StoreResult<()> {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await;
        self.check(&self.faults.fail_updates, "update", table)?;

        let Value::Object(patch) = patch else {
            return Err(StoreError::Rejected {
                operation: "update",
                table,
                message: "patch must be an object".to_string(),
            });
        };

        let mut tables = self.tables.write().await;
        let matching = tables
            .entry(table)
            .or_default()
            .iter_mut()
            .filter(|row| row.get(key_column).and_then(Value::as_str) == Some(key_value));
        for row in matching {
            if let Value::Object(fields) = row {
                for (column, value) in &patch {
                    fields.insert(column.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn select(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Value>> {
        self.counters.selects.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await;
        self.check(&self.faults.fail_selects, "select", table)?;

        let tables = self.tables.read().await;
        let matching = tables
            .get(&table)
            .into_iter()
            .flatten()
            .filter(|row| filter.matches(row))
            .take(filter.row_limit().unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn select_single(&self, table: Table, filter: &Filter) -> StoreResult<Option<Value>> {
        let rows = self.select(table, &filter.clone().limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    async fn aggregate(&self, since: DateTime<Utc>) -> StoreResult<AggregationSummary> {
        self.counters.aggregates.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await;
        self.check(&self.faults.fail_aggregate, "aggregate", Table::Events)?;

        let sessions = self.sessions().await?;
        let events = self.events().await?;
        Ok(summarize(&sessions, &events, since))
    }

    fn subscribe(&self, table: Table) -> Subscription {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match channels.get(&table) {
            Some(sender) => Subscription::new(table, sender.subscribe()),
            None => Subscription::closed(table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Notification;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_select() {
        let store = MemoryStore::new();
        store.insert(Table::Sessions, json!({"session_id": "a", "page_count": 1})).await.unwrap();
        store.insert(Table::Sessions, json!({"session_id": "b", "page_count": 2})).await.unwrap();

        let rows = store.select(Table::Sessions, &Filter::new().eq("session_id", "b")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["page_count"], 2);

        let all = store.select(Table::Sessions, &Filter::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.select(Table::Events, &Filter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_select_single() {
        let store = MemoryStore::new();
        let filter = Filter::new().eq("session_id", "a");
        assert!(store.select_single(Table::Sessions, &filter).await.unwrap().is_none());

        store.insert(Table::Sessions, json!({"session_id": "a"})).await.unwrap();
        assert!(store.select_single(Table::Sessions, &filter).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_merges_patch() {
        let store = MemoryStore::new();
        store
            .insert(Table::Sessions, json!({"session_id": "a", "page_count": 1, "entry_page": "/"}))
            .await
            .unwrap();

        store
            .update(Table::Sessions, "session_id", "a", json!({"page_count": 2, "exit_page": "/x"}))
            .await
            .unwrap();

        let rows = store.rows(Table::Sessions).await;
        assert_eq!(rows[0]["page_count"], 2);
        assert_eq!(rows[0]["exit_page"], "/x");
        assert_eq!(rows[0]["entry_page"], "/");
    }

    #[tokio::test]
    async fn test_update_missing_row_is_ok() {
        let store = MemoryStore::new();
        let result = store
            .update(Table::Sessions, "session_id", "missing", json!({"page_count": 2}))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_update_rejects_non_object_patch() {
        let store = MemoryStore::new();
        let result = store.update(Table::Sessions, "session_id", "a", json!(3)).await;
        assert!(matches!(result, Err(StoreError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let store = MemoryStore::new();
        let row = json!({"session_id": "a"});
        assert!(store.insert_if_absent(Table::Sessions, "session_id", row.clone()).await.unwrap());
        assert!(!store.insert_if_absent(Table::Sessions, "session_id", row).await.unwrap());
        assert_eq!(store.rows(Table::Sessions).await.len(), 1);

        let missing_key = store.insert_if_absent(Table::Sessions, "session_id", json!({})).await;
        assert!(matches!(missing_key, Err(StoreError::MissingKey(_))));
    }

    #[tokio::test]
    async fn test_insert_if_absent_unsupported() {
        let store = MemoryStore::without_upsert();
        let result = store
            .insert_if_absent(Table::Sessions, "session_id", json!({"session_id": "a"}))
            .await;
        assert!(matches!(result, Err(StoreError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.set_fail_inserts(true);
        store.set_fail_selects(true);
        store.set_fail_updates(true);
        store.set_fail_aggregate(true);

        assert!(store.insert(Table::Events, json!({})).await.is_err());
        assert!(store.select(Table::Events, &Filter::new()).await.is_err());
        assert!(store.update(Table::Events, "id", "x", json!({})).await.is_err());
        assert!(store.aggregate(Utc::now()).await.is_err());
        assert!(store.rows(Table::Events).await.is_empty());

        let counts = store.call_counts();
        assert_eq!(counts, CallCounts { inserts: 1, updates: 1, selects: 1, aggregates: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_secs(3));

        let started = tokio::time::Instant::now();
        store.insert(Table::Events, json!({})).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_subscribe_receives_inserts() {
        let store = MemoryStore::new();
        let mut events = store.subscribe(Table::Events);
        let mut sessions = store.subscribe(Table::Sessions);

        store.insert(Table::Events, json!({"id": "e1"})).await.unwrap();

        match events.recv().await {
            Some(Notification::Insert(change)) => {
                assert_eq!(change.table, Table::Events);
                assert_eq!(change.row["id"], "e1");
            }
            other => panic!("unexpected notification: {:?}", other),
        }

        store.disconnect();
        assert!(sessions.recv().await.is_none());
        assert!(store.subscribe(Table::Events).recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_insert_does_not_notify() {
        let store = MemoryStore::new();
        let mut events = store.subscribe(Table::Events);
        store.set_fail_inserts(true);
        let _ = store.insert(Table::Events, json!({"id": "e1"})).await;
        store.set_fail_inserts(false);
        store.insert(Table::Events, json!({"id": "e2"})).await.unwrap();

        match events.recv().await {
            Some(Notification::Insert(change)) => assert_eq!(change.row["id"], "e2"),
            other => panic!("unexpected notification: {:?}", other),
        }
    }
}
