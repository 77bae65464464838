//! Bus adapter abstractions.
//!
//! Stages communicate only through typed envelopes published to named
//! topics. The transport guarantees at-least-once, unordered delivery;
//! deduplication is the application's responsibility (receipts, see the
//! store module). The transport owns the retry policy: max delivery attempts
//! per subscription, then routing to the dead-letter companion topic.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Logical topic for reasoning requests.
pub const TOPIC_REASONING: &str = "reasoning-requested";
/// Logical topic for action requests.
pub const TOPIC_ACTION: &str = "action-requested";
/// Dead-letter companion of the reasoning topic.
pub const TOPIC_REASONING_DEAD_LETTER: &str = "reasoning-dead-letter";
/// Dead-letter companion of the action topic.
pub const TOPIC_ACTION_DEAD_LETTER: &str = "action-dead-letter";

/// Max delivery attempts per subscription before dead-lettering.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Event variants carried over the bus. Closed set; parsed into variants at
/// decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ReasoningRequested,
    ActionRequested,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ReasoningRequested => "reasoning_requested",
            EventType::ActionRequested => "action_requested",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage that produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Producer {
    Api,
    Reasoner,
    Executor,
}

impl Producer {
    pub fn as_str(self) -> &'static str {
        match self {
            Producer::Api => "api",
            Producer::Reasoner => "reasoner",
            Producer::Executor => "executor",
        }
    }
}

impl std::fmt::Display for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed envelope carried over a topic.
///
/// `event_id` is unique per logical event: two publishes with the same id
/// produce at most one completed downstream receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per logical event (UUID)
    pub event_id: String,
    pub event_type: EventType,
    pub conversation_id: String,
    pub message_id: String,
    /// ISO-8601 UTC
    pub timestamp: DateTime<Utc>,
    pub producer: Producer,
    /// Free-form event payload
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope with a fresh event ID, stamped now.
    pub fn new(
        event_type: EventType,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        producer: Producer,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            timestamp: Utc::now(),
            producer,
            payload,
        }
    }

    /// Transport-level attributes surfaced alongside the payload, for
    /// subscription filtering and operator inspection.
    pub fn attributes(&self) -> HashMap<String, String> {
        HashMap::from([
            ("eventId".to_string(), self.event_id.clone()),
            ("eventType".to_string(), self.event_type.to_string()),
            (
                "conversationId".to_string(),
                self.conversation_id.clone(),
            ),
        ])
    }

    /// Encode to the wire format: JSON, UTF-8, base64-wrapped.
    pub fn encode(&self) -> Result<String, BusError> {
        let json = serde_json::to_vec(self).map_err(|e| BusError::Encode(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Decode the wire format back into a typed envelope.
    ///
    /// A missing or undecodable payload is a poison message: the caller must
    /// ack without retrying.
    pub fn decode(data: &str) -> Result<Envelope, DecodeError> {
        if data.trim().is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| DecodeError::Base64(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| DecodeError::Json(e.to_string()))
    }
}

/// Poison-message decoding failures. Ack and discard, never retry.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("invalid base64: {0}")]
    Base64(String),

    #[error("invalid envelope JSON: {0}")]
    Json(String),
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("internal bus error: {0}")]
    Internal(String),
}

/// A message as it sits on the transport: wire-encoded data plus attributes.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// Base64-wrapped JSON envelope
    pub data: String,
    /// Transport attributes (`eventId`, `eventType`, `conversationId`)
    pub attributes: HashMap<String, String>,
}

/// A single delivery attempt of a published message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: PublishedMessage,
    /// 1-based delivery attempt counter, maintained by the transport
    pub attempt: u32,
}

impl Delivery {
    /// Decode this delivery's envelope.
    pub fn envelope(&self) -> Result<Envelope, DecodeError> {
        Envelope::decode(&self.message.data)
    }
}

/// Topic-based publish/pull transport with at-least-once semantics.
///
/// `pull` hands the next delivery to exactly one consumer of the topic.
/// A consumer that cannot complete a delivery returns it via `nack`; the
/// transport re-enqueues it with an incremented attempt counter, or routes
/// it to the dead-letter companion once attempts are exhausted. Not nacking
/// acknowledges the delivery.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to a named topic.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// Pull the next delivery from a topic, waiting until one is available.
    /// Returns `None` when the topic is closed for consumption.
    async fn pull(&self, topic: &str) -> Result<Option<Delivery>, BusError>;

    /// Negatively acknowledge a delivery so the transport redelivers it (or
    /// dead-letters it once attempts are exhausted).
    async fn nack(&self, topic: &str, delivery: Delivery) -> Result<(), BusError>;

    /// Drain the dead-letter companion of a topic for operator inspection.
    /// Nothing consumes dead letters automatically.
    async fn drain_dead_letters(&self, topic: &str) -> Result<Vec<Delivery>, BusError>;
}
