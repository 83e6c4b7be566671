//! Analytics Store
//!
//! Data model and storage collaborator for the site analytics pipeline.
//!
//! - [`model`] - Session and event rows, the aggregation summary
//! - [`DataStore`] - the relational store the pipeline writes to and reads from
//! - [`Subscription`] - row-level insert notifications
//! - [`MemoryStore`] - in-process store with fault injection
//! - [`Clock`] - wall-clock source, with a manual clock for tests
//!
//! # Example
//!
//! ```rust
//! use analytics_store::{DataStore, Filter, MemoryStore, Table};
//! use serde_json::json;
//!
//! # tokio_test_block(async {
//! let store = MemoryStore::new();
//! store.insert(Table::Events, json!({"id": "e1", "event_type": "click"})).await?;
//!
//! let clicks = store
//!     .select(Table::Events, &Filter::new().eq("event_type", "click"))
//!     .await?;
//! assert_eq!(clicks.len(), 1);
//! # Ok::<(), analytics_store::StoreError>(())
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod aggregate;
mod clock;
mod data_store;
mod error;
mod filter;
mod memory;
pub mod model;
mod subscription;

pub use clock::{Clock, ManualClock, SystemClock};
pub use data_store::DataStore;
pub use error::{StoreError, StoreResult};
pub use filter::{Condition, Filter};
pub use memory::{CallCounts, MemoryStore};
pub use model::{
    AggregationSummary, DeviceStat, DeviceType, EventRow, EventType, PageStat, SessionRow,
    SourceStat, Table,
};
pub use subscription::{ChangeEvent, Notification, Subscription};
