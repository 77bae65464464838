//! Executor worker.
//!
//! Consumes `action_requested` deliveries: claims the event receipt, checks
//! for an existing result by intent (defense in depth), invokes the tool
//! function, persists the result, and drives the conversation to its
//! terminal state. Tool determinism is required so that repeated execution
//! yields the same output even when both dedup layers fail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use relay_core::bus::{Delivery, Envelope};
use relay_core::store::{ConversationStore, DedupStore, ReceiptMeta, StoreError};
use relay_core::types::{ActionResult, ConversationState, EventLogEntry};

use crate::functions::ToolFn;
use crate::runner::{EventHandler, HandlerOutcome};
use crate::transitions::transition_forward;
use crate::RuntimeError;

const HANDLER_NAME: &str = "executor";

pub struct ExecutorHandler {
    conversations: Arc<dyn ConversationStore>,
    dedup: Arc<dyn DedupStore>,
    tools: Arc<dyn ToolFn>,
    stale_threshold: Duration,
}

impl ExecutorHandler {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        dedup: Arc<dyn DedupStore>,
        tools: Arc<dyn ToolFn>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            conversations,
            dedup,
            tools,
            stale_threshold,
        }
    }

    /// A result already exists for this intent. Make sure the conversation
    /// reached its terminal state (an earlier worker may have died between
    /// persisting and transitioning), then retire the receipt.
    async fn settle_existing(
        &self,
        envelope: &Envelope,
        intent_id: &str,
    ) -> Result<HandlerOutcome, RuntimeError> {
        let results = self
            .conversations
            .list_action_results(&envelope.conversation_id)
            .await?;
        if let Some(existing) = results.iter().find(|r| r.intent_id == intent_id) {
            let terminal = if existing.success {
                ConversationState::ActionCompleted
            } else {
                ConversationState::FailedExecution
            };
            transition_forward(&self.conversations, &envelope.conversation_id, terminal).await?;
        }
        self.dedup.complete_receipt(&envelope.event_id).await?;
        tracing::debug!(
            event_id = %envelope.event_id,
            intent_id = %intent_id,
            "action already executed; receipt retired"
        );
        Ok(HandlerOutcome::Duplicate)
    }
}

#[async_trait]
impl EventHandler for ExecutorHandler {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, RuntimeError> {
        let envelope = match delivery.envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(
                    attempt = delivery.attempt,
                    error = %err,
                    "poison action envelope discarded"
                );
                return Ok(HandlerOutcome::Poison);
            }
        };

        let claimed = self
            .dedup
            .claim_receipt(
                &envelope.event_id,
                ReceiptMeta::new(
                    HANDLER_NAME,
                    &envelope.conversation_id,
                    &envelope.message_id,
                ),
                self.stale_threshold,
            )
            .await?;
        if !claimed {
            tracing::debug!(event_id = %envelope.event_id, "action event already claimed");
            return Ok(HandlerOutcome::Duplicate);
        }

        let (Some(intent_id), Some(action)) = (
            envelope.payload.get("intentId").and_then(Value::as_str),
            envelope.payload.get("action").and_then(Value::as_str),
        ) else {
            tracing::error!(
                event_id = %envelope.event_id,
                "action envelope missing intentId/action; discarding"
            );
            return Ok(HandlerOutcome::Poison);
        };
        let parameters = envelope
            .payload
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if self
            .conversations
            .find_action_result_by_intent(&envelope.conversation_id, intent_id)
            .await?
        {
            return self.settle_existing(&envelope, intent_id).await;
        }

        let outcome = self.tools.execute(action, &parameters);
        let result = if outcome.success {
            ActionResult::success(
                &envelope.conversation_id,
                intent_id,
                &envelope.message_id,
                outcome.result,
            )
        } else {
            ActionResult::failure(
                &envelope.conversation_id,
                intent_id,
                &envelope.message_id,
                outcome.result,
                outcome.error.unwrap_or_else(|| "tool failed".to_string()),
            )
        };

        match self.conversations.append_action_result(&result).await {
            Ok(()) => {}
            // A racing worker slipped past both dedup layers; its result
            // stands and this delivery retires quietly.
            Err(StoreError::AlreadyExists(_)) => {
                return self.settle_existing(&envelope, intent_id).await;
            }
            Err(err) => return Err(err.into()),
        }

        let mut detail = Map::new();
        detail.insert("intentId".to_string(), Value::String(intent_id.to_string()));
        detail.insert("action".to_string(), Value::String(action.to_string()));
        detail.insert("success".to_string(), Value::Bool(result.success));
        self.conversations
            .append_event_log(&EventLogEntry::new(
                &envelope.event_id,
                &envelope.conversation_id,
                envelope.event_type.as_str(),
                HANDLER_NAME,
                detail,
            ))
            .await?;

        let terminal = if result.success {
            ConversationState::ActionCompleted
        } else {
            ConversationState::FailedExecution
        };
        transition_forward(&self.conversations, &envelope.conversation_id, terminal).await?;
        self.dedup.complete_receipt(&envelope.event_id).await?;

        tracing::info!(
            conversation_id = %envelope.conversation_id,
            intent_id = %intent_id,
            action = %action,
            success = result.success,
            "action executed"
        );
        Ok(HandlerOutcome::Completed)
    }
}
