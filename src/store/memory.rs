use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::EventStore;
use crate::error::StoreError;
use crate::types::{CheckpointEntry, Event, FailureEventEntry, NewEvent};

#[derive(Default)]
struct Tables {
    events: Vec<Event>,
    checkpoints: Vec<CheckpointEntry>,
    failures: Vec<FailureEventEntry>,
    next_sequence: i64,
}

/// Process-local store. Used by tests and `DATABASE_PATH=:memory:`.
#[derive(Default)]
pub struct InMemoryEventStore {
    tables: RwLock<Tables>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event row, in append order.
    pub async fn events(&self) -> Vec<Event> {
        self.tables.read().await.events.clone()
    }

    pub async fn checkpoints(&self) -> Vec<CheckpointEntry> {
        self.tables.read().await.checkpoints.clone()
    }

    pub async fn failures(&self) -> Vec<FailureEventEntry> {
        self.tables.read().await.failures.clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn event_exists(&self, delivery_id: &str) -> Result<bool, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.events.iter().any(|e| e.delivery_id == delivery_id))
    }

    async fn count_events(&self) -> Result<u64, StoreError> {
        Ok(self.tables.read().await.events.len() as u64)
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let mut tables = self.tables.write().await;
        tables.next_sequence += 1;
        let stored = event.with_sequence(tables.next_sequence);
        tables.events.push(stored.clone());
        Ok(stored)
    }

    async fn events_after(
        &self,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let tables = self.tables.read().await;
        let floor = after.unwrap_or(i64::MIN);
        // Appends are in sequence order already
        Ok(tables
            .events
            .iter()
            .filter(|e| e.sequence > floor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_checkpoint(&self) -> Result<Option<CheckpointEntry>, StoreError> {
        let tables = self.tables.read().await;
        // Ties on created_at go to the later write.
        Ok(tables
            .checkpoints
            .iter()
            .enumerate()
            .max_by_key(|(idx, c)| (c.created_at, *idx))
            .map(|(_, c)| c.clone()))
    }

    async fn write_checkpoint(&self, entry: CheckpointEntry) -> Result<(), StoreError> {
        self.tables.write().await.checkpoints.push(entry);
        Ok(())
    }

    async fn record_failure(
        &self,
        delivery_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.tables.write().await.failures.push(FailureEventEntry {
            delivery_id: delivery_id.to_string(),
            created_at: at,
        });
        Ok(())
    }

    async fn count_failures(&self, delivery_id: &str) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .failures
            .iter()
            .filter(|f| f.delivery_id == delivery_id)
            .count() as u64)
    }
}
