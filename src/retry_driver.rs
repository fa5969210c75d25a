//! Checkpointed replay of stored events onto the topic.
//!
//! One pass reads the current checkpoint, scans every event stored after it
//! in sequence order, and publishes each delivery again. Publishing is safe to
//! repeat because consumers deduplicate by `delivery_id`. The checkpoint only
//! moves across the unbroken run of events that were published or
//! dead-lettered, so anything that failed is scanned again next pass.
//!
//! All state lives in the store; the driver keeps nothing between passes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{error, info, instrument, warn};

use crate::backoff::{self, RetryPolicy};
use crate::error::{RetryDriverError, StoreError};
use crate::publisher::Publisher;
use crate::store::EventStore;
use crate::types::{CheckpointEntry, Event, OutboundMessage};

/// Extra time the final checkpoint write gets once the pass deadline is spent.
const CHECKPOINT_WRITE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Deliveries with at least this many recorded failures are skipped.
    pub retry_limit: u64,
    pub batch_size: usize,
    pub timeout: Duration,
    pub publish_policy: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            batch_size: 500,
            timeout: Duration::from_secs(300),
            publish_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub scanned: u64,
    pub published: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// Checkpoint in force after the pass.
    pub checkpoint: Option<CheckpointEntry>,
    pub timed_out: bool,
}

pub struct RetryDriver {
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn Publisher>,
    settings: RetrySettings,
    running: Mutex<()>,
}

enum Replay {
    Published,
    DeadLettered,
    Failed,
}

impl RetryDriver {
    pub fn new(
        store: Arc<dyn EventStore>,
        publisher: Arc<dyn Publisher>,
        settings: RetrySettings,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
            running: Mutex::new(()),
        }
    }

    /// Run one pass bounded by the configured timeout.
    ///
    /// Refuses to start while another pass in this process is running. Store
    /// errors abort the pass without touching the checkpoint. Store calls
    /// share the pass deadline with publishes; only the final checkpoint
    /// write gets a short grace period past it.
    pub async fn run_pass(&self) -> Result<PassSummary, RetryDriverError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| RetryDriverError::AlreadyRunning)?;
        self.run_pass_until(Instant::now() + self.settings.timeout).await
    }

    #[instrument(skip(self), fields(retry_limit = self.settings.retry_limit))]
    async fn run_pass_until(&self, deadline: Instant) -> Result<PassSummary, RetryDriverError> {
        let previous = timeout_at(deadline, self.store.latest_checkpoint())
            .await
            .map_err(|_| StoreError::new("latest_checkpoint", "deadline passed"))??;
        match &previous {
            Some(c) => info!(
                delivery_id = %c.delivery_id,
                sequence = c.sequence,
                "starting retry pass from checkpoint"
            ),
            None => info!("starting retry pass from the beginning"),
        }

        let mut summary = PassSummary::default();
        let mut cursor = previous.as_ref().map(|c| c.sequence);
        // Last event of the unbroken processed run, if it moved.
        let mut advance_to: Option<(String, i64)> = None;
        let mut blocked = false;
        // delivery_id -> whether it was resolved (published or dead-lettered)
        let mut handled: HashMap<String, bool> = HashMap::new();

        'scan: loop {
            let scan = self.store.events_after(cursor, self.settings.batch_size);
            let page = match timeout_at(deadline, scan).await {
                Ok(page) => page?,
                Err(_) => {
                    summary.timed_out = true;
                    break;
                }
            };
            if page.is_empty() {
                break;
            }

            for event in page {
                if Instant::now() >= deadline {
                    summary.timed_out = true;
                    break 'scan;
                }
                summary.scanned += 1;

                let resolved = match handled.get(&event.delivery_id) {
                    Some(resolved) => *resolved,
                    None => {
                        let outcome = match self.replay(&event, deadline).await? {
                            Some(outcome) => outcome,
                            None => {
                                summary.timed_out = true;
                                break 'scan;
                            }
                        };
                        let resolved = match outcome {
                            Replay::Published => {
                                summary.published += 1;
                                true
                            }
                            Replay::DeadLettered => {
                                summary.dead_lettered += 1;
                                true
                            }
                            Replay::Failed => {
                                summary.failed += 1;
                                false
                            }
                        };
                        handled.insert(event.delivery_id.clone(), resolved);
                        resolved
                    }
                };

                cursor = Some(event.sequence);
                if !resolved {
                    blocked = true;
                }
                if !blocked {
                    advance_to = Some((event.delivery_id, event.sequence));
                }
            }
        }

        summary.checkpoint = match advance_to {
            Some((delivery_id, sequence))
                if previous.as_ref().map_or(true, |p| sequence > p.sequence) =>
            {
                // created_at never goes backwards, even if the clock does.
                let created_at = match &previous {
                    Some(p) if p.created_at > Utc::now() => p.created_at,
                    _ => Utc::now(),
                };
                let entry = CheckpointEntry {
                    delivery_id,
                    sequence,
                    created_at,
                };
                timeout(CHECKPOINT_WRITE_GRACE, self.store.write_checkpoint(entry.clone()))
                    .await
                    .map_err(|_| StoreError::new("write_checkpoint", "timed out"))??;
                info!(
                    delivery_id = %entry.delivery_id,
                    sequence = entry.sequence,
                    "checkpoint advanced"
                );
                Some(entry)
            }
            _ => previous,
        };

        if summary.timed_out {
            warn!(scanned = summary.scanned, "retry pass hit its deadline");
        }
        info!(
            scanned = summary.scanned,
            published = summary.published,
            failed = summary.failed,
            dead_lettered = summary.dead_lettered,
            "retry pass finished"
        );
        Ok(summary)
    }

    /// Publish one event again. `None` means the deadline passed first.
    async fn replay(
        &self,
        event: &Event,
        deadline: Instant,
    ) -> Result<Option<Replay>, RetryDriverError> {
        let count = self.store.count_failures(&event.delivery_id);
        let failures = match timeout_at(deadline, count).await {
            Ok(count) => count?,
            Err(_) => return Ok(None),
        };
        if failures >= self.settings.retry_limit {
            warn!(
                delivery_id = %event.delivery_id,
                sequence = event.sequence,
                failures,
                "delivery is dead-lettered; skipping"
            );
            return Ok(Some(Replay::DeadLettered));
        }

        let message = OutboundMessage::for_event(event);
        let publish = backoff::retry(&self.settings.publish_policy, "republish", || {
            self.publisher.publish(&message)
        });

        match timeout_at(deadline, publish).await {
            Err(_) => Ok(None),
            Ok(Ok(_)) => Ok(Some(Replay::Published)),
            Ok(Err(e)) => {
                error!(
                    delivery_id = %event.delivery_id,
                    sequence = event.sequence,
                    error = %e,
                    "republish failed"
                );
                let record = self.store.record_failure(&event.delivery_id, Utc::now());
                match timeout_at(deadline, record).await {
                    Ok(recorded) => recorded?,
                    Err(_) => return Ok(None),
                }
                Ok(Some(Replay::Failed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::InMemoryPublisher;
    use crate::store::InMemoryEventStore;
    use crate::types::NewEvent;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory store with switchable faults on the calls a pass makes.
    #[derive(Default)]
    struct FaultyStore {
        inner: InMemoryEventStore,
        scans: AtomicUsize,
        /// `events_after` fails from this call number on (1-based).
        fail_scan_from: Option<usize>,
        hang_scans: bool,
        fail_checkpoint_write: bool,
    }

    #[async_trait]
    impl EventStore for FaultyStore {
        async fn event_exists(&self, delivery_id: &str) -> Result<bool, StoreError> {
            self.inner.event_exists(delivery_id).await
        }

        async fn count_events(&self) -> Result<u64, StoreError> {
            self.inner.count_events().await
        }

        async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
            self.inner.append_event(event).await
        }

        async fn events_after(
            &self,
            after: Option<i64>,
            limit: usize,
        ) -> Result<Vec<Event>, StoreError> {
            let call = self.scans.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang_scans {
                std::future::pending::<()>().await;
            }
            if self.fail_scan_from.is_some_and(|from| call >= from) {
                return Err(StoreError::new("events_after", "connection reset"));
            }
            self.inner.events_after(after, limit).await
        }

        async fn latest_checkpoint(&self) -> Result<Option<CheckpointEntry>, StoreError> {
            self.inner.latest_checkpoint().await
        }

        async fn write_checkpoint(&self, entry: CheckpointEntry) -> Result<(), StoreError> {
            if self.fail_checkpoint_write {
                return Err(StoreError::new("write_checkpoint", "disk full"));
            }
            self.inner.write_checkpoint(entry).await
        }

        async fn record_failure(
            &self,
            delivery_id: &str,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.record_failure(delivery_id, at).await
        }

        async fn count_failures(&self, delivery_id: &str) -> Result<u64, StoreError> {
            self.inner.count_failures(delivery_id).await
        }
    }

    fn faulty_driver(
        store: Arc<FaultyStore>,
        timeout: Duration,
    ) -> (RetryDriver, Arc<InMemoryPublisher>) {
        let publisher = Arc::new(InMemoryPublisher::new());
        let driver = RetryDriver::new(
            store,
            publisher.clone(),
            RetrySettings {
                retry_limit: 3,
                batch_size: 2,
                timeout,
                publish_policy: RetryPolicy::once(),
            },
        );
        (driver, publisher)
    }

    struct Harness {
        driver: RetryDriver,
        store: Arc<InMemoryEventStore>,
        publisher: Arc<InMemoryPublisher>,
    }

    fn harness(retry_limit: u64) -> Harness {
        let store = Arc::new(InMemoryEventStore::new());
        let publisher = Arc::new(InMemoryPublisher::new());
        let driver = RetryDriver::new(
            store.clone(),
            publisher.clone(),
            RetrySettings {
                retry_limit,
                batch_size: 2,
                timeout: Duration::from_secs(30),
                publish_policy: RetryPolicy::once(),
            },
        );
        Harness {
            driver,
            store,
            publisher,
        }
    }

    async fn seed(store: &InMemoryEventStore, ids: &[&str]) {
        for id in ids {
            store
                .append_event(NewEvent {
                    delivery_id: id.to_string(),
                    signature: "sha256=00".into(),
                    received: Utc::now(),
                    event: "issues".into(),
                    payload: format!(r#"{{"id":"{id}"}}"#),
                })
                .await
                .unwrap();
        }
    }

    fn published_ids(messages: &[OutboundMessage]) -> Vec<String> {
        messages.iter().map(|m| m.delivery_id().to_string()).collect()
    }

    #[tokio::test]
    async fn first_pass_replays_everything_in_order() {
        let h = harness(3);
        seed(&h.store, &["d-1", "d-2", "d-3"]).await;

        let summary = h.driver.run_pass().await.unwrap();
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.published, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.checkpoint.unwrap().delivery_id, "d-3");
        assert_eq!(published_ids(&h.publisher.messages().await), ["d-1", "d-2", "d-3"]);
        assert!(h.store.failures().await.is_empty());
    }

    #[tokio::test]
    async fn empty_store_writes_no_checkpoint() {
        let h = harness(3);
        let summary = h.driver.run_pass().await.unwrap();
        assert_eq!(summary, PassSummary::default());
        assert!(h.store.checkpoints().await.is_empty());
    }

    #[tokio::test]
    async fn second_pass_only_sees_new_events() {
        let h = harness(3);
        seed(&h.store, &["d-1", "d-2"]).await;
        h.driver.run_pass().await.unwrap();

        seed(&h.store, &["d-3"]).await;
        let summary = h.driver.run_pass().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.checkpoint.unwrap().delivery_id, "d-3");
        assert_eq!(
            published_ids(&h.publisher.messages().await),
            ["d-1", "d-2", "d-3"]
        );
    }

    #[tokio::test]
    async fn failure_holds_checkpoint_but_later_events_still_publish() {
        let h = harness(3);
        seed(&h.store, &["d-1", "d-2", "d-3"]).await;
        h.publisher.fail_delivery("d-2").await;

        let summary = h.driver.run_pass().await.unwrap();
        assert_eq!(summary.published, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.checkpoint.unwrap().delivery_id, "d-1");
        assert_eq!(h.store.count_failures("d-2").await.unwrap(), 1);
        assert_eq!(published_ids(&h.publisher.messages().await), ["d-1", "d-3"]);

        h.publisher.heal("d-2").await;
        let summary = h.driver.run_pass().await.unwrap();
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.checkpoint.unwrap().delivery_id, "d-3");
    }

    #[tokio::test]
    async fn dead_letter_after_retry_limit_failures() {
        let retry_limit = 2;
        let h = harness(retry_limit);
        seed(&h.store, &["d-1", "d-2"]).await;
        h.publisher.fail_delivery("d-1").await;

        for _ in 0..retry_limit {
            let summary = h.driver.run_pass().await.unwrap();
            assert_eq!(summary.failed, 1);
            assert!(summary.checkpoint.is_none());
        }
        assert_eq!(h.store.count_failures("d-1").await.unwrap(), retry_limit);

        let summary = h.driver.run_pass().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.checkpoint.unwrap().delivery_id, "d-2");
        assert_eq!(h.store.count_failures("d-1").await.unwrap(), retry_limit);
    }

    #[tokio::test]
    async fn repeated_delivery_id_is_published_once_per_pass() {
        let h = harness(3);
        seed(&h.store, &["d-1", "d-1", "d-2"]).await;

        let summary = h.driver.run_pass().await.unwrap();
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.published, 2);
        let checkpoint = summary.checkpoint.unwrap();
        assert_eq!(checkpoint.delivery_id, "d-2");
        assert_eq!(checkpoint.sequence, 3);
    }

    #[tokio::test]
    async fn checkpoint_is_monotonic_across_idle_passes() {
        let h = harness(3);
        seed(&h.store, &["d-1", "d-2", "d-3"]).await;

        let mut last: Option<CheckpointEntry> = None;
        for _ in 0..4 {
            let checkpoint = h.driver.run_pass().await.unwrap().checkpoint.unwrap();
            if let Some(prev) = &last {
                assert!(checkpoint.created_at >= prev.created_at);
                assert!(checkpoint.sequence >= prev.sequence);
            }
            last = Some(checkpoint);
        }
        assert_eq!(h.store.checkpoints().await.len(), 1);
    }

    #[tokio::test]
    async fn past_deadline_stops_before_publishing() {
        let h = harness(3);
        seed(&h.store, &["d-1"]).await;
        let summary = h.driver.run_pass_until(Instant::now()).await.unwrap();
        assert!(summary.timed_out);
        assert_eq!(summary.scanned, 0);
        assert!(h.publisher.messages().await.is_empty());
        assert!(summary.checkpoint.is_none());
    }

    #[tokio::test]
    async fn concurrent_pass_is_refused() {
        let h = harness(3);
        let _held = h.driver.running.lock().await;
        assert!(matches!(
            h.driver.run_pass().await,
            Err(RetryDriverError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn scan_error_on_later_page_aborts_without_checkpoint() {
        let store = Arc::new(FaultyStore {
            fail_scan_from: Some(2),
            ..FaultyStore::default()
        });
        seed(&store.inner, &["d-1", "d-2", "d-3"]).await;
        let (driver, _publisher) = faulty_driver(store.clone(), Duration::from_secs(30));

        let err = driver.run_pass().await.unwrap_err();
        match err {
            RetryDriverError::Store(e) => assert_eq!(e.operation, "events_after"),
            other => panic!("expected a store error, got {other:?}"),
        }
        assert!(store.inner.checkpoints().await.is_empty());
        assert!(store.inner.failures().await.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_write_error_aborts_the_pass() {
        let store = Arc::new(FaultyStore {
            fail_checkpoint_write: true,
            ..FaultyStore::default()
        });
        seed(&store.inner, &["d-1"]).await;
        let (driver, _publisher) = faulty_driver(store.clone(), Duration::from_secs(30));

        assert!(matches!(
            driver.run_pass().await,
            Err(RetryDriverError::Store(ref e)) if e.operation == "write_checkpoint"
        ));
        assert!(store.inner.latest_checkpoint().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hung_store_ends_the_pass_at_its_deadline() {
        let store = Arc::new(FaultyStore {
            hang_scans: true,
            ..FaultyStore::default()
        });
        seed(&store.inner, &["d-1"]).await;
        let (driver, publisher) = faulty_driver(store.clone(), Duration::from_millis(50));

        let summary = tokio::time::timeout(Duration::from_secs(5), driver.run_pass())
            .await
            .expect("pass outlived its deadline")
            .unwrap();
        assert!(summary.timed_out);
        assert_eq!(summary.scanned, 0);
        assert!(summary.checkpoint.is_none());
        assert!(publisher.messages().await.is_empty());
        assert!(store.inner.checkpoints().await.is_empty());
    }
}
