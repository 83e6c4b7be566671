//! Error types for data store operations.

use thiserror::Error;

use crate::model::Table;

/// Errors reported by a [`DataStore`](crate::DataStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row could not be converted to or from its JSON representation
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store refused the operation
    #[error("Store rejected {operation} on {table}: {message}")]
    Rejected {
        /// Operation name (insert, update, select, aggregate)
        operation: &'static str,
        /// Target table
        table: Table,
        /// Message returned by the store
        message: String,
    },

    /// The store could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// The store does not offer this capability
    #[error("Operation not supported by this store: {0}")]
    Unsupported(&'static str),

    /// A row was written without the key column the operation needs
    #[error("Row is missing key column `{0}`")]
    MissingKey(String),
}

/// Result type for data store operations.
pub type StoreResult<T> = Result<T, StoreError>;
