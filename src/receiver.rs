//! Ingestion protocol for one inbound webhook delivery.
//!
//! Transport-independent: the HTTP layer extracts headers and body and maps
//! the result back onto status codes.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::backoff::{self, RetryPolicy};
use crate::error::ReceiverError;
use crate::publisher::Publisher;
use crate::scope::RepositoryScope;
use crate::store::EventStore;
use crate::types::{NewEvent, OutboundMessage};
use crate::verification::SignatureVerifier;

const MAX_DELIVERY_ID_LEN: usize = 255;

/// Request data the receiver needs, as pulled off the wire.
#[derive(Debug, Clone, Copy)]
pub struct IncomingDelivery<'a> {
    pub delivery_id: Option<&'a str>,
    pub event: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and published.
    Accepted { sequence: i64 },
    /// Already stored; acknowledged without publishing again.
    Duplicate,
    /// Authenticated, but for a repository outside the configured scope.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub retry_limit: u64,
    pub publish_policy: RetryPolicy,
    pub republish_on_redelivery: bool,
    pub repository_scope: RepositoryScope,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            publish_policy: RetryPolicy::default(),
            republish_on_redelivery: false,
            repository_scope: RepositoryScope::All,
        }
    }
}

pub struct WebhookReceiver {
    verifier: SignatureVerifier,
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn Publisher>,
    settings: ReceiverSettings,
}

impl WebhookReceiver {
    pub fn new(
        verifier: SignatureVerifier,
        store: Arc<dyn EventStore>,
        publisher: Arc<dyn Publisher>,
        settings: ReceiverSettings,
    ) -> Self {
        Self {
            verifier,
            store,
            publisher,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    #[instrument(
        skip(self, delivery),
        fields(delivery_id = delivery.delivery_id.unwrap_or("-"), event = delivery.event.unwrap_or("-"))
    )]
    pub async fn ingest(&self, delivery: IncomingDelivery<'_>) -> Result<IngestOutcome, ReceiverError> {
        if delivery.body.is_empty() {
            warn!("rejecting delivery with empty body");
            return Err(ReceiverError::BadRequest("request body is empty".into()));
        }

        let signature = delivery
            .signature
            .ok_or_else(|| ReceiverError::Unauthorized("missing signature header".into()))?;
        if !self.verifier.verify(delivery.body, signature) {
            warn!("signature mismatch");
            return Err(ReceiverError::Unauthorized("signature mismatch".into()));
        }

        let delivery_id = required_header(delivery.delivery_id, "delivery id")?;
        if delivery_id.len() > MAX_DELIVERY_ID_LEN {
            return Err(ReceiverError::BadRequest("delivery id is too long".into()));
        }
        let event = required_header(delivery.event, "event type")?;
        let payload = std::str::from_utf8(delivery.body)
            .map_err(|_| ReceiverError::BadRequest("body is not valid UTF-8".into()))?;

        if !self.settings.repository_scope.admits(delivery.body) {
            info!("delivery is for a repository outside the configured scope");
            return Ok(IngestOutcome::Ignored);
        }

        if self.store.event_exists(delivery_id).await? && !self.is_redelivery(delivery_id).await? {
            info!("duplicate delivery acknowledged");
            return Ok(IngestOutcome::Duplicate);
        }

        let stored = self
            .store
            .append_event(NewEvent {
                delivery_id: delivery_id.to_string(),
                signature: signature.trim().to_string(),
                received: Utc::now(),
                event: event.to_string(),
                payload: payload.to_string(),
            })
            .await?;

        let message = OutboundMessage::for_event(&stored);
        let published = backoff::retry(&self.settings.publish_policy, "publish", || {
            self.publisher.publish(&message)
        })
        .await;

        match published {
            Ok(message_id) => {
                info!(sequence = stored.sequence, message_id = %message_id, "delivery accepted");
                Ok(IngestOutcome::Accepted {
                    sequence: stored.sequence,
                })
            }
            Err(e) => {
                error!(sequence = stored.sequence, error = %e, "publish failed");
                if let Err(record_err) = self.store.record_failure(delivery_id, Utc::now()).await {
                    error!(error = %record_err, "could not record publish failure");
                }
                Err(ReceiverError::Internal {
                    operation: "publish",
                    message: e.to_string(),
                })
            }
        }
    }

    /// A stored delivery counts as an explicit re-delivery when the sender is
    /// retrying after we failed it and it has not been dead-lettered.
    async fn is_redelivery(&self, delivery_id: &str) -> Result<bool, ReceiverError> {
        if !self.settings.republish_on_redelivery {
            return Ok(false);
        }
        let failures = self.store.count_failures(delivery_id).await?;
        if failures >= self.settings.retry_limit {
            warn!(failures, "delivery is dead-lettered; not republishing");
            return Ok(false);
        }
        Ok(failures > 0)
    }
}

fn required_header<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, ReceiverError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ReceiverError::BadRequest(format!("missing {what} header"))),
    }
}
