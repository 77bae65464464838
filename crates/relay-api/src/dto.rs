use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use relay_core::types::{ActionResult, Conversation, ConversationState, ReasoningIntent, UserMessage};

/// Outcome of a message submission.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The message was accepted and the reasoning event published.
    Accepted {
        message_id: String,
        conversation_id: String,
        event_id: String,
        state: ConversationState,
    },
    /// The client idempotency key was already claimed; nothing was written
    /// or published. Carries the message ID that won the original claim.
    Duplicate { message_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentView {
    pub id: String,
    pub message_id: String,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub confidence: f64,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResultView {
    pub id: String,
    pub intent_id: String,
    pub message_id: String,
    pub result: Map<String, Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Conversation document with its children, as returned by the read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: String,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<MessageView>,
    pub intents: Vec<IntentView>,
    pub actions: Vec<ActionResultView>,
}

impl ConversationView {
    pub fn assemble(
        conversation: Conversation,
        messages: Vec<UserMessage>,
        intents: Vec<ReasoningIntent>,
        actions: Vec<ActionResult>,
    ) -> Self {
        Self {
            id: conversation.id,
            state: conversation.state,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            messages: messages
                .into_iter()
                .map(|m| MessageView {
                    id: m.id,
                    content: m.content,
                    created_at: m.created_at,
                })
                .collect(),
            intents: intents
                .into_iter()
                .map(|i| IntentView {
                    id: i.id,
                    message_id: i.message_id,
                    action: i.action,
                    parameters: i.parameters,
                    confidence: i.confidence,
                    valid: i.valid,
                    validation_error: i.validation_error,
                    created_at: i.created_at,
                })
                .collect(),
            actions: actions
                .into_iter()
                .map(|a| ActionResultView {
                    id: a.id,
                    intent_id: a.intent_id,
                    message_id: a.message_id,
                    result: a.result,
                    success: a.success,
                    error: a.error,
                    executed_at: a.executed_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            service: "api".to_string(),
        }
    }
}
