//! Reasoning intent type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured intent derived from a user message by the reasoner. Written
/// exactly once per delivery family, valid or not.
///
/// Invariant: `valid` is true iff `validation_error` is absent. The invalid
/// form preserves whatever `action` string the reasoning function produced so
/// the audit trail shows what was rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningIntent {
    /// Unique identifier (UUID)
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Originating message
    pub message_id: String,
    /// Requested action name
    pub action: String,
    /// Free-form action parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Reasoner confidence in [0, 1]
    pub confidence: f64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Whether the intent passed schema validation
    pub valid: bool,
    /// Validation error string when invalid
    #[serde(default)]
    pub validation_error: Option<String>,
}
