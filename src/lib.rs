//! GitHub webhook ingestion with durable storage and checkpointed replay.
//!
//! Inbound deliveries are authenticated, appended to an event store and
//! published to a Pub/Sub topic. A separate retry pass walks the store from
//! the last checkpoint and republishes anything the topic may have missed.

pub mod backoff;
pub mod config;
pub mod error;
pub mod http_server;
pub mod publisher;
pub mod receiver;
pub mod retry_driver;
pub mod scheduler;
pub mod scope;
pub mod store;
pub mod types;
pub mod verification;

use std::sync::Arc;

use config::{Config, StoreLocation};
use error::{ConfigError, PublishError, StoreError};
use publisher::{PubSubPublisher, Publisher};
use store::{EventStore, InMemoryEventStore, SqliteEventStore};

pub fn open_store(location: &StoreLocation) -> Result<Arc<dyn EventStore>, StoreError> {
    Ok(match location {
        StoreLocation::InMemory => Arc::new(InMemoryEventStore::new()),
        StoreLocation::Sqlite(path) => Arc::new(SqliteEventStore::open(path)?),
    })
}

pub fn pubsub_publisher(config: &Config) -> Result<Arc<dyn Publisher>, PublishError> {
    Ok(Arc::new(PubSubPublisher::new(
        &config.pubsub_endpoint,
        &config.topic_path,
        config.pubsub_token.clone(),
    )?))
}

pub fn signature_verifier(config: &Config) -> Result<verification::SignatureVerifier, ConfigError> {
    verification::SignatureVerifier::new(config.webhook_secret.as_bytes())
        .ok_or(ConfigError::Missing("WEBHOOK_SECRET"))
}
