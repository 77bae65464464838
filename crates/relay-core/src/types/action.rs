//! Action result type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of executing a validated intent as a tool call. At most one
/// result exists per intent; the executor's dedup layers enforce this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Unique identifier (UUID)
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// The intent this result answers
    pub intent_id: String,
    /// Originating message
    pub message_id: String,
    /// Free-form result mapping from the tool function
    #[serde(default)]
    pub result: Map<String, Value>,
    /// Whether the tool call succeeded
    pub success: bool,
    /// Tool error string on failure
    #[serde(default)]
    pub error: Option<String>,
    /// Execution timestamp
    pub executed_at: DateTime<Utc>,
}

impl ActionResult {
    /// Create a successful result.
    pub fn success(
        conversation_id: impl Into<String>,
        intent_id: impl Into<String>,
        message_id: impl Into<String>,
        result: Map<String, Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            intent_id: intent_id.into(),
            message_id: message_id.into(),
            result,
            success: true,
            error: None,
            executed_at: Utc::now(),
        }
    }

    /// Create a failed result carrying the tool error.
    pub fn failure(
        conversation_id: impl Into<String>,
        intent_id: impl Into<String>,
        message_id: impl Into<String>,
        result: Map<String, Value>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            intent_id: intent_id.into(),
            message_id: message_id.into(),
            result,
            success: false,
            error: Some(error.into()),
            executed_at: Utc::now(),
        }
    }
}
