//! The data store collaborator.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreResult;
use crate::filter::Filter;
use crate::model::{AggregationSummary, Table};
use crate::subscription::Subscription;

/// Relational store reachable over the network.
///
/// Every write is an unconditional single-row operation; the store offers
/// no transactions or locks to the pipeline.
#[trait_variant::make(Send)]
pub trait DataStore: Send + Sync {
    /// Append a row.
    async fn insert(&self, table: Table, row: Value) -> StoreResult<()>;

    /// Insert unless a row with the same `key_column` value exists
    /// ("on conflict do nothing"). Returns `true` if the row was written.
    ///
    /// Stores without the primitive return [`StoreError::Unsupported`](crate::StoreError::Unsupported).
    async fn insert_if_absent(&self, table: Table, key_column: &str, row: Value)
        -> StoreResult<bool>;

    /// Merge `patch` into every row whose `key_column` equals `key_value`.
    /// Updating zero rows is not an error.
    async fn update(
        &self,
        table: Table,
        key_column: &str,
        key_value: &str,
        patch: Value,
    ) -> StoreResult<()>;

    async fn select(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Value>>;

    /// First matching row, if any.
    async fn select_single(&self, table: Table, filter: &Filter) -> StoreResult<Option<Value>>;

    /// Server-side aggregation over rows created at or after `since`.
    async fn aggregate(&self, since: DateTime<Utc>) -> StoreResult<AggregationSummary>;

    /// Watch a table for inserts.
    fn subscribe(&self, table: Table) -> Subscription;
}
