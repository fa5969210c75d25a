use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One accepted webhook delivery, as stored.
///
/// The payload is kept verbatim so schema changes on the sender side never
/// break ingestion. Several rows may share a `delivery_id` when the sender
/// re-delivers; consumers deduplicate by `delivery_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned, strictly increasing. Replay order.
    pub sequence: i64,
    pub delivery_id: String,
    pub signature: String,
    pub received: DateTime<Utc>,
    pub event: String,
    pub payload: String,
}

/// An event row before the store has assigned it a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub delivery_id: String,
    pub signature: String,
    pub received: DateTime<Utc>,
    pub event: String,
    pub payload: String,
}

impl NewEvent {
    pub fn with_sequence(self, sequence: i64) -> Event {
        Event {
            sequence,
            delivery_id: self.delivery_id,
            signature: self.signature,
            received: self.received,
            event: self.event,
            payload: self.payload,
        }
    }
}

/// Replay watermark. The most recently written entry is the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub delivery_id: String,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

/// One failed processing attempt for a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEventEntry {
    pub delivery_id: String,
    pub created_at: DateTime<Utc>,
}

pub const ATTR_DELIVERY_ID: &str = "delivery_id";
pub const ATTR_EVENT: &str = "event";

/// What goes onto the topic: the raw body plus routing attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn for_event(event: &Event) -> Self {
        Self::new(&event.delivery_id, &event.event, event.payload.as_bytes())
    }

    pub fn new(delivery_id: &str, event: &str, data: &[u8]) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(ATTR_DELIVERY_ID.to_string(), delivery_id.to_string());
        attributes.insert(ATTR_EVENT.to_string(), event.to_string());
        Self {
            data: data.to_vec(),
            attributes,
        }
    }

    pub fn delivery_id(&self) -> &str {
        self.attributes
            .get(ATTR_DELIVERY_ID)
            .map(String::as_str)
            .unwrap_or("")
    }
}
