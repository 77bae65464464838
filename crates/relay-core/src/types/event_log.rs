//! Conversation event-log entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Append-only audit record of a significant pipeline transition, keyed by
/// the event's unique ID and scoped beneath its conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// The bus event's unique ID
    pub event_id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Event type label, e.g. `reasoning_requested`
    pub event_type: String,
    /// Stage that recorded the entry
    pub producer: String,
    /// Recording timestamp
    pub recorded_at: DateTime<Utc>,
    /// Free-form detail payload
    #[serde(default)]
    pub detail: Map<String, Value>,
}

impl EventLogEntry {
    /// Create an entry stamped now.
    pub fn new(
        event_id: impl Into<String>,
        conversation_id: impl Into<String>,
        event_type: impl Into<String>,
        producer: impl Into<String>,
        detail: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            conversation_id: conversation_id.into(),
            event_type: event_type.into(),
            producer: producer.into(),
            recorded_at: Utc::now(),
            detail,
        }
    }
}
