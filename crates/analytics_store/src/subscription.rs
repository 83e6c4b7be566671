//! Row-level change notifications.

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::model::Table;

/// A row inserted into a watched table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub row: Value,
}

/// What a subscriber observes on its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A row was inserted
    Insert(ChangeEvent),
    /// The subscriber fell behind and `n` notifications were dropped.
    /// Something still changed, so consumers should treat it like an insert.
    Missed(u64),
}

/// Live subscription to inserts on one table. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    table: Table,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(table: Table, receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { table, receiver }
    }

    /// A subscription whose channel is already closed, for stores that
    /// cannot deliver notifications.
    pub fn closed(table: Table) -> Self {
        let (_sender, receiver) = broadcast::channel(1);
        Self { table, receiver }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// `true` once the sending side is gone and no notification can
    /// arrive.
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Wait for the next notification.
    ///
    /// Returns `None` once the channel is disconnected.
    pub async fn recv(&mut self) -> Option<Notification> {
        match self.receiver.recv().await {
            Ok(event) => Some(Notification::Insert(event)),
            Err(RecvError::Lagged(n)) => {
                tracing::debug!(table = %self.table, missed = n, "Subscriber lagged");
                Some(Notification::Missed(n))
            }
            Err(RecvError::Closed) => None,
        }
    }
}
