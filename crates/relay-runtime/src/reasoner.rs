//! Reasoner worker.
//!
//! Consumes `reasoning_requested` deliveries: claims the event receipt,
//! invokes the reasoning function, validates the candidate, persists the
//! intent (valid or not), and either fails the conversation's validation or
//! publishes the action request.
//!
//! The two-step `INTENT_VALIDATED` then `ACTION_REQUESTED` transition is
//! deliberate: it preserves an observable "validated but not yet
//! dispatched" state. If the publish fails after `INTENT_VALIDATED`, the
//! handler raises so the bus redelivers; the next delivery reclaims the
//! stale receipt and replays from the beginning, with every step tolerant
//! of the work its predecessor already finished.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use relay_core::bus::{Delivery, Envelope, EventType, MessageBus, Producer};
use relay_core::store::{ConversationStore, DedupStore, ReceiptMeta, StoreError};
use relay_core::types::{ConversationState, ReasoningIntent};
use relay_core::validator::{validate_intent, IntentValidation};

use crate::functions::ReasoningFn;
use crate::runner::{EventHandler, HandlerOutcome};
use crate::transitions::transition_forward;
use crate::RuntimeError;

const HANDLER_NAME: &str = "reasoner";

pub struct ReasonerHandler {
    conversations: Arc<dyn ConversationStore>,
    dedup: Arc<dyn DedupStore>,
    bus: Arc<dyn MessageBus>,
    reasoning: Arc<dyn ReasoningFn>,
    action_topic: String,
    stale_threshold: Duration,
}

impl ReasonerHandler {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        dedup: Arc<dyn DedupStore>,
        bus: Arc<dyn MessageBus>,
        reasoning: Arc<dyn ReasoningFn>,
        action_topic: impl Into<String>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            conversations,
            dedup,
            bus,
            reasoning,
            action_topic: action_topic.into(),
            stale_threshold,
        }
    }

    async fn message_content(&self, envelope: &Envelope) -> Result<Option<String>, RuntimeError> {
        if let Some(content) = envelope.payload.get("content").and_then(Value::as_str) {
            return Ok(Some(content.to_string()));
        }
        // Envelope payloads are advisory; the message document is the
        // source of truth when the payload is thin.
        let message = self
            .conversations
            .get_message(&envelope.conversation_id, &envelope.message_id)
            .await?;
        Ok(message.map(|m| m.content))
    }

    async fn persist_intent(&self, intent: &ReasoningIntent) -> Result<(), RuntimeError> {
        match self.conversations.append_intent(intent).await {
            Ok(()) => Ok(()),
            // A crash-replay re-derives the identical intent; the first
            // write stands.
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl EventHandler for ReasonerHandler {
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
                    "poison reasoning envelope discarded"
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
            tracing::debug!(event_id = %envelope.event_id, "reasoning event already claimed");
            return Ok(HandlerOutcome::Duplicate);
        }

        let Some(content) = self.message_content(&envelope).await? else {
            tracing::error!(
                event_id = %envelope.event_id,
                conversation_id = %envelope.conversation_id,
                "reasoning event has no message content; discarding"
            );
            return Ok(HandlerOutcome::Poison);
        };

        let candidate =
            self.reasoning
                .reason(&envelope.conversation_id, &envelope.message_id, &content);
        let validation = validate_intent(&candidate);
        let intent = intent_from_candidate(&candidate, &envelope, &validation);
        self.persist_intent(&intent).await?;

        match validation {
            IntentValidation::Invalid { error } => {
                tracing::info!(
                    conversation_id = %envelope.conversation_id,
                    intent_id = %intent.id,
                    error = %error,
                    "intent failed validation"
                );
                transition_forward(
                    &self.conversations,
                    &envelope.conversation_id,
                    ConversationState::FailedValidation,
                )
                .await?;
                self.dedup.complete_receipt(&envelope.event_id).await?;
                Ok(HandlerOutcome::Completed)
            }
            IntentValidation::Valid(validated) => {
                transition_forward(
                    &self.conversations,
                    &envelope.conversation_id,
                    ConversationState::IntentValidated,
                )
                .await?;

                let mut payload = Map::new();
                payload.insert("intentId".to_string(), Value::String(intent.id.clone()));
                payload.insert(
                    "action".to_string(),
                    Value::String(validated.action.to_string()),
                );
                payload.insert(
                    "parameters".to_string(),
                    Value::Object(validated.parameters.clone()),
                );
                payload.insert(
                    "confidence".to_string(),
                    serde_json::json!(validated.confidence),
                );
                let mut action_envelope = Envelope::new(
                    EventType::ActionRequested,
                    &envelope.conversation_id,
                    &envelope.message_id,
                    Producer::Reasoner,
                    payload,
                );
                // Derived from the reasoning event so a replayed publish
                // reuses the same event ID and dedups downstream.
                action_envelope.event_id = Uuid::new_v5(
                    &Uuid::NAMESPACE_OID,
                    format!("action:{}", envelope.event_id).as_bytes(),
                )
                .to_string();

                // A failed publish must raise: the conversation stays in
                // INTENT_VALIDATED and redelivery replays this handler.
                self.bus.publish(&self.action_topic, &action_envelope).await?;

                transition_forward(
                    &self.conversations,
                    &envelope.conversation_id,
                    ConversationState::ActionRequested,
                )
                .await?;
                self.dedup.complete_receipt(&envelope.event_id).await?;

                tracing::info!(
                    conversation_id = %envelope.conversation_id,
                    intent_id = %intent.id,
                    action = %validated.action,
                    action_event_id = %action_envelope.event_id,
                    "intent validated and dispatched"
                );
                Ok(HandlerOutcome::Completed)
            }
        }
    }
}

fn intent_from_candidate(
    candidate: &Value,
    envelope: &Envelope,
    validation: &IntentValidation,
) -> ReasoningIntent {
    match validation {
        IntentValidation::Valid(validated) => ReasoningIntent {
            id: validated.intent_id.clone(),
            conversation_id: validated.conversation_id.clone(),
            message_id: validated.message_id.clone(),
            action: validated.action.to_string(),
            parameters: validated.parameters.clone(),
            confidence: validated.confidence,
            created_at: chrono::Utc::now(),
            valid: true,
            validation_error: None,
        },
        IntentValidation::Invalid { error } => {
            // Preserve whatever the reasoning function produced so the
            // audit trail shows what was rejected.
            let fallback_id = Uuid::new_v5(
                &Uuid::NAMESPACE_OID,
                format!("{}:{}", envelope.conversation_id, envelope.message_id).as_bytes(),
            )
            .to_string();
            ReasoningIntent {
                id: candidate
                    .get("intentId")
                    .and_then(Value::as_str)
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or(fallback_id.as_str())
                    .to_string(),
                conversation_id: envelope.conversation_id.clone(),
                message_id: envelope.message_id.clone(),
                action: candidate
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                parameters: candidate
                    .get("parameters")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                confidence: candidate
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                created_at: chrono::Utc::now(),
                valid: false,
                validation_error: Some(error.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::KeywordReasoner;
    use relay_core::bus::{PublishedMessage, TOPIC_ACTION};
    use relay_core::types::UserMessage;
    use relay_stores::{InMemoryConversationStore, InMemoryDedupStore, InProcessBus};

    struct Fixture {
        conversations: Arc<InMemoryConversationStore>,
        dedup: Arc<InMemoryDedupStore>,
        bus: Arc<InProcessBus>,
        handler: ReasonerHandler,
    }

    fn fixture() -> Fixture {
        let conversations = Arc::new(InMemoryConversationStore::new());
        let dedup = Arc::new(InMemoryDedupStore::new());
        let bus = Arc::new(InProcessBus::with_default_topics());
        let handler = ReasonerHandler::new(
            conversations.clone(),
            dedup.clone(),
            bus.clone(),
            Arc::new(KeywordReasoner),
            TOPIC_ACTION,
            Duration::from_secs(120),
        );
        Fixture {
            conversations,
            dedup,
            bus,
            handler,
        }
    }

    /// Stand a conversation up the way the ingress leaves it.
    async fn seed_conversation(fixture: &Fixture, content: &str) -> Delivery {
        let conversation = fixture
            .conversations
            .create_conversation("conv-1")
            .await
            .expect("create");
        let mut message = UserMessage::new(&conversation.id, content);
        message.id = "msg-1".to_string();
        fixture
            .conversations
            .append_message(&message)
            .await
            .expect("message");
        fixture
            .conversations
            .transition_state(&conversation.id, ConversationState::ReasoningRequested)
            .await
            .expect("transition");

        let mut payload = Map::new();
        payload.insert("content".to_string(), Value::String(content.to_string()));
        let envelope = Envelope::new(
            EventType::ReasoningRequested,
            "conv-1",
            "msg-1",
            Producer::Api,
            payload,
        );
        Delivery {
            message: PublishedMessage {
                data: envelope.encode().expect("encode"),
                attributes: envelope.attributes(),
            },
            attempt: 1,
        }
    }

    #[test]
    fn test_valid_intent_is_dispatched() {
        tokio_test::block_on(async {
            let fixture = fixture();
            let delivery = seed_conversation(&fixture, "search for cats").await;

            let outcome = fixture.handler.handle(&delivery).await.expect("handle");
            assert_eq!(outcome, HandlerOutcome::Completed);

            let intents = fixture
                .conversations
                .list_intents("conv-1")
                .await
                .expect("intents");
            assert_eq!(intents.len(), 1);
            assert!(intents[0].valid);
            assert_eq!(intents[0].action, "search");

            let conversation = fixture
                .conversations
                .get_conversation("conv-1")
                .await
                .expect("get")
                .expect("conversation");
            assert_eq!(conversation.state, ConversationState::ActionRequested);

            let action = fixture
                .bus
                .try_pull(TOPIC_ACTION)
                .await
                .expect("pull")
                .expect("action delivery");
            let action_envelope = action.envelope().expect("decode");
            assert_eq!(action_envelope.event_type, EventType::ActionRequested);
            assert_eq!(action_envelope.payload["intentId"], intents[0].id.as_str());
            assert_eq!(action_envelope.payload["action"], "search");
        });
    }

    #[test]
    fn test_invalid_intent_fails_validation_without_dispatch() {
        tokio_test::block_on(async {
            let fixture = fixture();
            let delivery = seed_conversation(&fixture, "dance for me").await;

            let outcome = fixture.handler.handle(&delivery).await.expect("handle");
            assert_eq!(outcome, HandlerOutcome::Completed);

            let intents = fixture
                .conversations
                .list_intents("conv-1")
                .await
                .expect("intents");
            assert_eq!(intents.len(), 1);
            assert!(!intents[0].valid);
            assert_eq!(intents[0].action, "dance");
            assert!(intents[0].validation_error.is_some());

            let conversation = fixture
                .conversations
                .get_conversation("conv-1")
                .await
                .expect("get")
                .expect("conversation");
            assert_eq!(conversation.state, ConversationState::FailedValidation);

            assert!(fixture
                .bus
                .try_pull(TOPIC_ACTION)
                .await
                .expect("pull")
                .is_none());
        });
    }

    #[test]
    fn test_duplicate_delivery_short_circuits() {
        tokio_test::block_on(async {
            let fixture = fixture();
            let delivery = seed_conversation(&fixture, "search for cats").await;

            assert_eq!(
                fixture.handler.handle(&delivery).await.expect("first"),
                HandlerOutcome::Completed
            );
            assert_eq!(
                fixture.handler.handle(&delivery).await.expect("second"),
                HandlerOutcome::Duplicate
            );

            // No second intent, no second action publish, exactly one
            // conversation advance.
            let intents = fixture
                .conversations
                .list_intents("conv-1")
                .await
                .expect("intents");
            assert_eq!(intents.len(), 1);
            assert!(fixture
                .bus
                .try_pull(TOPIC_ACTION)
                .await
                .expect("first action")
                .is_some());
            assert!(fixture
                .bus
                .try_pull(TOPIC_ACTION)
                .await
                .expect("second action")
                .is_none());
        });
    }

    #[test]
    fn test_poison_delivery_is_discarded() {
        tokio_test::block_on(async {
            let fixture = fixture();
            let delivery = Delivery {
                message: PublishedMessage {
                    data: "%%%garbage%%%".to_string(),
                    attributes: Default::default(),
                },
                attempt: 1,
            };

            let outcome = fixture.handler.handle(&delivery).await.expect("handle");
            assert_eq!(outcome, HandlerOutcome::Poison);
        });
    }

    #[test]
    fn test_replay_after_crash_resumes_and_completes() {
        tokio_test::block_on(async {
            let fixture = fixture();
            let delivery = seed_conversation(&fixture, "search for cats").await;
            let envelope = delivery.envelope().expect("decode");

            // Simulate a worker that validated and transitioned, then died
            // before publishing: receipt stuck in processing, state at
            // INTENT_VALIDATED, intent already persisted.
            let stale_handler = ReasonerHandler::new(
                fixture.conversations.clone(),
                fixture.dedup.clone(),
                fixture.bus.clone(),
                Arc::new(KeywordReasoner),
                TOPIC_ACTION,
                Duration::from_secs(0),
            );
            fixture
                .dedup
                .claim_receipt(
                    &envelope.event_id,
                    ReceiptMeta::new(HANDLER_NAME, "conv-1", "msg-1"),
                    Duration::from_secs(120),
                )
                .await
                .expect("claim");
            let candidate = KeywordReasoner.reason("conv-1", "msg-1", "search for cats");
            let validation = validate_intent(&candidate);
            let intent = intent_from_candidate(&candidate, &envelope, &validation);
            fixture
                .conversations
                .append_intent(&intent)
                .await
                .expect("intent");
            fixture
                .conversations
                .transition_state("conv-1", ConversationState::IntentValidated)
                .await
                .expect("transition");

            // Redelivery with a zero stale threshold reclaims and replays.
            let outcome = stale_handler.handle(&delivery).await.expect("replay");
            assert_eq!(outcome, HandlerOutcome::Completed);

            let conversation = fixture
                .conversations
                .get_conversation("conv-1")
                .await
                .expect("get")
                .expect("conversation");
            assert_eq!(conversation.state, ConversationState::ActionRequested);

            let intents = fixture
                .conversations
                .list_intents("conv-1")
                .await
                .expect("intents");
            assert_eq!(intents.len(), 1, "replay must not write a second intent");

            assert!(fixture
                .bus
                .try_pull(TOPIC_ACTION)
                .await
                .expect("pull")
                .is_some());
        });
    }
}
