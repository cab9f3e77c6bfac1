//! In-process stage completion bus.
//!
//! Producing stages publish a [`StageCompleted`] after the ledger transition
//! is committed, so a subscriber that observes the event can immediately
//! claim the successor unit.

use regsync_core::{UnitKey, UnitStatus};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCompleted {
    pub unit_id: i64,
    pub key: UnitKey,
    pub status: UnitStatus,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StageCompleted>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: StageCompleted) -> usize {
        trace!(unit_id = event.unit_id, key = %event.key, status = %event.status, "stage completed");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageCompleted> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
