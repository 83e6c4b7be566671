//! Analytics Dashboard
//!
//! Read side of the site analytics pipeline:
//!
//! - [`AggregationReader`] pulls the aggregation summary, today's hourly page
//!   views, the active-session count and an estimated conversion funnel, and
//!   publishes the result on a `watch` channel. A failed pull publishes
//!   `None`, never a zero-filled summary.
//! - [`RefreshController`] re-pulls after store inserts (debounced) and on a
//!   fixed interval, and reports its [`ConnectionState`].
//!
//! # Example
//!
//! ```rust,no_run
//! use analytics_dashboard::{AggregationReader, DashboardConfig, RefreshController};
//! use analytics_store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let store = Arc::new(MemoryStore::new());
//! let reader = Arc::new(AggregationReader::new(store, DashboardConfig::new()));
//! let mut updates = reader.subscribe();
//! let refresh = RefreshController::new(Arc::clone(&reader)).start();
//!
//! while updates.changed().await.is_ok() {
//!     match updates.borrow_and_update().as_ref() {
//!         Some(data) => println!("{} page views", data.summary.total_page_views),
//!         None => println!("no data"),
//!     }
//! }
//! refresh.shutdown().await;
//! # }
//! ```

mod config;
mod error;
pub mod reader;
pub mod refresh;

pub use config::DashboardConfig;
pub use error::{DashboardError, DashboardResult};
pub use reader::{AggregationReader, DashboardData, Funnel, FunnelStage, FUNNEL_FRACTIONS};
pub use refresh::{ConnectionState, RefreshController, RefreshHandle};
