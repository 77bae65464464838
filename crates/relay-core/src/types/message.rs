//! User message type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-submitted message, child of a conversation. Immutable after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    /// Unique identifier (UUID)
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Free-text content as submitted
    pub content: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Client idempotency key under which the message was accepted, if any
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl UserMessage {
    /// Create a new message with a fresh UUID.
    pub fn new(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            content: content.into(),
            created_at: Utc::now(),
            idempotency_key: None,
        }
    }

    /// Attach the client idempotency key the message was accepted under.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}
