//! Ingress service: the only client-facing write path.
//!
//! The idempotency claim precedes persistence to close the TOCTOU window:
//! two concurrent submissions with the same key race only inside one store
//! transaction, and only one wins. Reuse of an in-flight conversation is
//! rejected with a conflict before anything is written.

use std::sync::Arc;

use serde_json::{Map, Value};

use relay_core::bus::{Envelope, EventType, MessageBus, Producer};
use relay_core::store::{ConversationStore, DedupStore, IdempotencyClaim, StoreError};
use relay_core::types::{ConversationState, EventLogEntry, UserMessage};

use crate::dto::{ConversationView, SubmitOutcome};
use crate::ApiError;

/// Handles message submission and conversation lookup.
pub struct IngressService {
    conversations: Arc<dyn ConversationStore>,
    dedup: Arc<dyn DedupStore>,
    bus: Arc<dyn MessageBus>,
    reasoning_topic: String,
}

impl IngressService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        dedup: Arc<dyn DedupStore>,
        bus: Arc<dyn MessageBus>,
        reasoning_topic: impl Into<String>,
    ) -> Self {
        Self {
            conversations,
            dedup,
            bus,
            reasoning_topic: reasoning_topic.into(),
        }
    }

    /// Accept a message submission.
    ///
    /// The body is validated by hand so malformed shapes yield the exact
    /// client-facing error string rather than a deserializer's.
    pub async fn submit_message(
        &self,
        body: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<SubmitOutcome, ApiError> {
        let content = match body.get("content").and_then(Value::as_str) {
            Some(content) if !content.trim().is_empty() => content.to_string(),
            _ => {
                return Err(ApiError::InvalidArgument(
                    "Missing or invalid \"content\" field".to_string(),
                ));
            }
        };
        let supplied_conversation_id = body
            .get("conversationId")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string);

        // Reusing an active conversation is not a supported operation;
        // reject before burning the idempotency key or writing anything.
        if let Some(id) = &supplied_conversation_id {
            if let Some(existing) = self.conversations.get_conversation(id).await? {
                if existing.state != ConversationState::Received {
                    return Err(ApiError::Conflict(format!(
                        "conversation {} is already in state {}",
                        id, existing.state
                    )));
                }
            }
        }

        let message_id = uuid::Uuid::new_v4().to_string();

        if let Some(key) = idempotency_key {
            match self.dedup.claim_idempotency_key(key, &message_id).await? {
                IdempotencyClaim::New => {}
                IdempotencyClaim::Existing {
                    message_id: existing,
                } => {
                    tracing::info!(
                        idempotency_key = %key,
                        message_id = %existing,
                        "duplicate submission short-circuited"
                    );
                    return Ok(SubmitOutcome::Duplicate {
                        message_id: existing,
                    });
                }
            }
        }

        let conversation_id = match supplied_conversation_id {
            Some(id) => {
                // A client-chosen id is claimed on first use.
                match self.conversations.create_conversation(&id).await {
                    Ok(_) => {}
                    Err(StoreError::AlreadyExists(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.conversations.create_conversation(&id).await?;
                id
            }
        };

        let mut message = UserMessage::new(&conversation_id, &content);
        message.id = message_id.clone();
        if let Some(key) = idempotency_key {
            message = message.with_idempotency_key(key);
        }
        self.conversations.append_message(&message).await?;

        let mut payload = Map::new();
        payload.insert("content".to_string(), Value::String(content));
        let envelope = Envelope::new(
            EventType::ReasoningRequested,
            &conversation_id,
            &message_id,
            Producer::Api,
            payload,
        );
        self.bus
            .publish(&self.reasoning_topic, &envelope)
            .await
            .map_err(|e| ApiError::Internal(format!("publish failed: {}", e)))?;

        let mut detail = Map::new();
        detail.insert("messageId".to_string(), Value::String(message_id.clone()));
        self.conversations
            .append_event_log(&EventLogEntry::new(
                &envelope.event_id,
                &conversation_id,
                EventType::ReasoningRequested.as_str(),
                Producer::Api.as_str(),
                detail,
            ))
            .await?;

        let conversation = self
            .conversations
            .transition_state(&conversation_id, ConversationState::ReasoningRequested)
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            event_id = %envelope.event_id,
            "message accepted"
        );

        Ok(SubmitOutcome::Accepted {
            message_id,
            conversation_id,
            event_id: envelope.event_id,
            state: conversation.state,
        })
    }

    /// Load a conversation with its children.
    pub async fn get_conversation(&self, id: &str) -> Result<ConversationView, ApiError> {
        let conversation = self
            .conversations
            .get_conversation(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Conversation not found".to_string()))?;
        let messages = self.conversations.list_messages(id).await?;
        let intents = self.conversations.list_intents(id).await?;
        let actions = self.conversations.list_action_results(id).await?;
        Ok(ConversationView::assemble(
            conversation,
            messages,
            intents,
            actions,
        ))
    }
}
