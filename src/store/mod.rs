//! Row-store abstraction for events, checkpoints and failure records.
//!
//! All three tables are append-only. The "current" checkpoint is whichever
//! entry was written last; nothing is ever updated in place or deleted.

mod memory;
mod sqlite;

pub use memory::InMemoryEventStore;
pub use sqlite::SqliteEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{CheckpointEntry, Event, NewEvent};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Whether any row exists for this delivery.
    async fn event_exists(&self, delivery_id: &str) -> Result<bool, StoreError>;

    /// Total number of event rows, duplicates included.
    async fn count_events(&self) -> Result<u64, StoreError>;

    /// Append a row and return it with its assigned sequence.
    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError>;

    /// Rows with a sequence strictly greater than `after`, oldest first.
    /// `None` scans from the start of retained history.
    async fn events_after(&self, after: Option<i64>, limit: usize)
        -> Result<Vec<Event>, StoreError>;

    /// The most recently written checkpoint, if any.
    async fn latest_checkpoint(&self) -> Result<Option<CheckpointEntry>, StoreError>;

    async fn write_checkpoint(&self, entry: CheckpointEntry) -> Result<(), StoreError>;

    async fn record_failure(
        &self,
        delivery_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn count_failures(&self, delivery_id: &str) -> Result<u64, StoreError>;
}
