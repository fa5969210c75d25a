//! Publish/subscribe output.
//!
//! [`PubSubPublisher`] speaks the Cloud Pub/Sub REST API (and therefore the
//! emulator too). [`InMemoryPublisher`] keeps messages in a vector.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PublishError;
use crate::types::OutboundMessage;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message; returns the broker-assigned message id.
    async fn publish(&self, message: &OutboundMessage) -> Result<String, PublishError>;
}

// ─── Pub/Sub REST ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: Vec<PubsubMessage<'a>>,
}

#[derive(Serialize)]
struct PubsubMessage<'a> {
    data: String,
    attributes: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

pub struct PubSubPublisher {
    client: reqwest::Client,
    publish_url: String,
    token: Option<String>,
}

impl PubSubPublisher {
    /// `topic_path` is the full `projects/<project>/topics/<topic>` name.
    pub fn new(
        endpoint: &str,
        topic_path: &str,
        token: Option<String>,
    ) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("webhook-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            publish_url: format!("{}/v1/{}:publish", endpoint.trim_end_matches('/'), topic_path),
            token,
        })
    }

    pub fn publish_url(&self) -> &str {
        &self.publish_url
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<String, PublishError> {
        let body = PublishRequest {
            messages: vec![PubsubMessage {
                data: base64::engine::general_purpose::STANDARD.encode(&message.data),
                attributes: &message.attributes,
            }],
        };

        let mut request = self.client.post(&self.publish_url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| PublishError::MalformedResponse(e.to_string()))?;
        let message_id = parsed
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| PublishError::MalformedResponse("no messageIds returned".into()))?;

        debug!(
            delivery_id = %message.delivery_id(),
            message_id = %message_id,
            "published message"
        );
        Ok(message_id)
    }
}

// ─── In-memory ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorded {
    messages: Vec<OutboundMessage>,
    fail_next: u32,
    failing_deliveries: HashSet<String>,
    attempts: u64,
}

/// Keeps every published message; failures can be injected.
#[derive(Default)]
pub struct InMemoryPublisher {
    inner: Mutex<Recorded>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<OutboundMessage> {
        self.inner.lock().await.messages.clone()
    }

    /// Number of publish calls, successful or not.
    pub async fn attempts(&self) -> u64 {
        self.inner.lock().await.attempts
    }

    /// Make the next `n` publishes fail regardless of content.
    pub async fn fail_next(&self, n: u32) {
        self.inner.lock().await.fail_next = n;
    }

    /// Fail every publish for this delivery until `heal` is called.
    pub async fn fail_delivery(&self, delivery_id: &str) {
        self.inner
            .lock()
            .await
            .failing_deliveries
            .insert(delivery_id.to_string());
    }

    pub async fn heal(&self, delivery_id: &str) {
        self.inner.lock().await.failing_deliveries.remove(delivery_id);
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<String, PublishError> {
        let mut inner = self.inner.lock().await;
        inner.attempts += 1;

        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(PublishError::Unavailable("injected failure".into()));
        }
        if inner.failing_deliveries.contains(message.delivery_id()) {
            return Err(PublishError::Unavailable(format!(
                "injected failure for {}",
                message.delivery_id()
            )));
        }

        inner.messages.push(message.clone());
        Ok(uuid::Uuid::new_v4().to_string())
    }
}
