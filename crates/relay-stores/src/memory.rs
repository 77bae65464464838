//! In-memory store implementations for development and testing.
//!
//! A single lock over each document root stands in for the document store's
//! single-document transactional isolation: every transactional operation
//! runs under the write guard, so concurrent workers observe serializable
//! transitions and claims.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use relay_core::store::{
    ConversationStore, DedupStore, IdempotencyClaim, ReceiptMeta, StoreError,
};
use relay_core::types::{
    ActionResult, Conversation, ConversationState, EventLogEntry, IdempotencyKeyRecord, Receipt,
    ReceiptStatus, ReasoningIntent, UserMessage,
};

#[derive(Default)]
struct ConversationDocuments {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<UserMessage>>,
    intents: HashMap<String, Vec<ReasoningIntent>>,
    actions: HashMap<String, Vec<ActionResult>>,
    events: HashMap<String, Vec<EventLogEntry>>,
}

/// In-memory conversation store.
pub struct InMemoryConversationStore {
    documents: RwLock<ConversationDocuments>,
}

impl InMemoryConversationStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(ConversationDocuments::default()),
        }
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if documents.conversations.contains_key(id) {
            return Err(StoreError::AlreadyExists(format!("conversation {}", id)));
        }
        let conversation = Conversation::new(id);
        documents
            .conversations
            .insert(id.to_string(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(documents.conversations.get(id).cloned())
    }

    async fn transition_state(
        &self,
        id: &str,
        next: ConversationState,
    ) -> Result<Conversation, StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let conversation = documents
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
        if !conversation.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: conversation.state,
                to: next,
            });
        }
        conversation.state = next;
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    async fn append_message(&self, message: &UserMessage) -> Result<(), StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let messages = documents
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        if messages.iter().any(|m| m.id == message.id) {
            return Err(StoreError::AlreadyExists(format!("message {}", message.id)));
        }
        messages.push(message.clone());
        Ok(())
    }

    async fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<UserMessage>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(documents
            .messages
            .get(conversation_id)
            .and_then(|messages| messages.iter().find(|m| m.id == message_id))
            .cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<UserMessage>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(documents
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_intent(&self, intent: &ReasoningIntent) -> Result<(), StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let intents = documents
            .intents
            .entry(intent.conversation_id.clone())
            .or_default();
        if intents.iter().any(|i| i.id == intent.id) {
            return Err(StoreError::AlreadyExists(format!("intent {}", intent.id)));
        }
        intents.push(intent.clone());
        Ok(())
    }

    async fn list_intents(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ReasoningIntent>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(documents
            .intents
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_action_result(&self, result: &ActionResult) -> Result<(), StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let actions = documents
            .actions
            .entry(result.conversation_id.clone())
            .or_default();
        if actions.iter().any(|a| a.intent_id == result.intent_id) {
            return Err(StoreError::AlreadyExists(format!(
                "action result for intent {}",
                result.intent_id
            )));
        }
        actions.push(result.clone());
        Ok(())
    }

    async fn find_action_result_by_intent(
        &self,
        conversation_id: &str,
        intent_id: &str,
    ) -> Result<bool, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(documents
            .actions
            .get(conversation_id)
            .map(|actions| actions.iter().any(|a| a.intent_id == intent_id))
            .unwrap_or(false))
    }

    async fn list_action_results(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ActionResult>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(documents
            .actions
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_event_log(&self, entry: &EventLogEntry) -> Result<(), StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let events = documents
            .events
            .entry(entry.conversation_id.clone())
            .or_default();
        // Keyed by event ID; a replayed handler re-logging the same event is
        // a no-op, keeping the audit trail stable under redelivery.
        if events.iter().any(|e| e.event_id == entry.event_id) {
            return Ok(());
        }
        events.push(entry.clone());
        Ok(())
    }

    async fn list_event_log(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<EventLogEntry>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(documents
            .events
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory deduplication store.
pub struct InMemoryDedupStore {
    receipts: RwLock<HashMap<String, Receipt>>,
    keys: RwLock<HashMap<String, IdempotencyKeyRecord>>,
}

impl InMemoryDedupStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            receipts: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn claim_receipt(
        &self,
        event_id: &str,
        meta: ReceiptMeta,
        stale_after: Duration,
    ) -> Result<bool, StoreError> {
        let mut receipts = self
            .receipts
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let now = Utc::now();

        match receipts.entry(event_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Receipt {
                    event_id: event_id.to_string(),
                    handler: meta.handler,
                    conversation_id: meta.conversation_id,
                    message_id: meta.message_id,
                    status: ReceiptStatus::Processing,
                    claimed_at: now,
                    completed_at: None,
                    retried_at: None,
                });
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                match existing.status {
                    ReceiptStatus::Completed => Ok(false),
                    ReceiptStatus::Processing => {
                        let age = now.signed_duration_since(existing.claimed_at);
                        let stale = chrono::Duration::from_std(stale_after)
                            .map_err(|e| StoreError::Internal(e.to_string()))?;
                        if age < stale {
                            return Ok(false);
                        }
                        // The original worker crashed; hand the claim over.
                        existing.claimed_at = now;
                        existing.retried_at = Some(now);
                        tracing::warn!(
                            event_id = %event_id,
                            handler = %existing.handler,
                            "stale receipt reclaimed"
                        );
                        Ok(true)
                    }
                }
            }
        }
    }

    async fn complete_receipt(&self, event_id: &str) -> Result<(), StoreError> {
        let mut receipts = self
            .receipts
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let now = Utc::now();
        // Merge-write: completing an absent receipt materializes a completed
        // one so a redelivery cannot re-execute.
        let receipt = receipts
            .entry(event_id.to_string())
            .or_insert_with(|| Receipt {
                event_id: event_id.to_string(),
                handler: String::new(),
                conversation_id: String::new(),
                message_id: String::new(),
                status: ReceiptStatus::Processing,
                claimed_at: now,
                completed_at: None,
                retried_at: None,
            });
        receipt.status = ReceiptStatus::Completed;
        receipt.completed_at = Some(now);
        Ok(())
    }

    async fn get_receipt(&self, event_id: &str) -> Result<Option<Receipt>, StoreError> {
        let receipts = self
            .receipts
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(receipts.get(event_id).cloned())
    }

    async fn claim_idempotency_key(
        &self,
        key: &str,
        message_id: &str,
    ) -> Result<IdempotencyClaim, StoreError> {
        let mut keys = self
            .keys
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if let Some(existing) = keys.get(key) {
            return Ok(IdempotencyClaim::Existing {
                message_id: existing.message_id.clone(),
            });
        }
        keys.insert(
            key.to_string(),
            IdempotencyKeyRecord {
                key: key.to_string(),
                message_id: message_id.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(IdempotencyClaim::New)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn meta() -> ReceiptMeta {
        ReceiptMeta::new("reasoner", "conv-1", "msg-1")
    }

    #[test]
    fn test_create_conversation_rejects_duplicate_id() {
        tokio_test::block_on(async {
            let store = InMemoryConversationStore::new();
            store.create_conversation("conv-1").await.expect("create");

            assert!(matches!(
                store.create_conversation("conv-1").await,
                Err(StoreError::AlreadyExists(_))
            ));
        });
    }

    #[test]
    fn test_transition_state_enforces_table() {
        tokio_test::block_on(async {
            let store = InMemoryConversationStore::new();
            store.create_conversation("conv-1").await.expect("create");

            let conversation = store
                .transition_state("conv-1", ConversationState::ReasoningRequested)
                .await
                .expect("legal transition");
            assert_eq!(conversation.state, ConversationState::ReasoningRequested);

            assert!(matches!(
                store
                    .transition_state("conv-1", ConversationState::ActionCompleted)
                    .await,
                Err(StoreError::InvalidTransition { .. })
            ));
        });
    }

    #[test]
    fn test_transition_state_unknown_conversation() {
        tokio_test::block_on(async {
            let store = InMemoryConversationStore::new();
            assert!(matches!(
                store
                    .transition_state("ghost", ConversationState::ReasoningRequested)
                    .await,
                Err(StoreError::NotFound(_))
            ));
        });
    }

    #[test]
    fn test_action_result_is_unique_per_intent() {
        tokio_test::block_on(async {
            let store = InMemoryConversationStore::new();
            let first = ActionResult::success(
                "conv-1",
                "intent-1",
                "msg-1",
                serde_json::Map::new(),
            );
            store.append_action_result(&first).await.expect("first");

            let second = ActionResult::success(
                "conv-1",
                "intent-1",
                "msg-1",
                serde_json::Map::new(),
            );
            assert!(matches!(
                store.append_action_result(&second).await,
                Err(StoreError::AlreadyExists(_))
            ));

            assert!(store
                .find_action_result_by_intent("conv-1", "intent-1")
                .await
                .expect("find"));
            assert!(!store
                .find_action_result_by_intent("conv-1", "intent-2")
                .await
                .expect("find"));
        });
    }

    #[test]
    fn test_event_log_replay_is_noop() {
        tokio_test::block_on(async {
            let store = InMemoryConversationStore::new();
            let entry = EventLogEntry::new(
                "evt-1",
                "conv-1",
                "reasoning_requested",
                "api",
                serde_json::Map::new(),
            );
            store.append_event_log(&entry).await.expect("first");
            store.append_event_log(&entry).await.expect("replay");

            let entries = store.list_event_log("conv-1").await.expect("list");
            assert_eq!(entries.len(), 1);
        });
    }

    #[test]
    fn test_claim_receipt_first_claim_wins() {
        tokio_test::block_on(async {
            let store = InMemoryDedupStore::new();
            let stale = Duration::from_secs(120);

            assert!(store
                .claim_receipt("evt-1", meta(), stale)
                .await
                .expect("claim"));
            assert!(!store
                .claim_receipt("evt-1", meta(), stale)
                .await
                .expect("duplicate claim"));
        });
    }

    #[test]
    fn test_claim_receipt_completed_is_final() {
        tokio_test::block_on(async {
            let store = InMemoryDedupStore::new();
            let stale = Duration::from_secs(0);

            assert!(store
                .claim_receipt("evt-1", meta(), Duration::from_secs(120))
                .await
                .expect("claim"));
            store.complete_receipt("evt-1").await.expect("complete");

            // Even a zero stale threshold cannot reclaim a completed receipt.
            assert!(!store
                .claim_receipt("evt-1", meta(), stale)
                .await
                .expect("claim after completion"));
        });
    }

    #[test]
    fn test_claim_receipt_reclaims_stale_processing() {
        tokio_test::block_on(async {
            let store = InMemoryDedupStore::new();

            assert!(store
                .claim_receipt("evt-1", meta(), Duration::from_secs(120))
                .await
                .expect("claim"));

            // A zero threshold makes the claim immediately stale.
            assert!(store
                .claim_receipt("evt-1", meta(), Duration::from_secs(0))
                .await
                .expect("reclaim"));

            let receipt = store
                .get_receipt("evt-1")
                .await
                .expect("get")
                .expect("receipt");
            assert_eq!(receipt.status, ReceiptStatus::Processing);
            assert!(receipt.retried_at.is_some());
        });
    }

    #[test]
    fn test_complete_receipt_upserts_when_absent() {
        tokio_test::block_on(async {
            let store = InMemoryDedupStore::new();
            store.complete_receipt("evt-lost").await.expect("upsert");

            let receipt = store
                .get_receipt("evt-lost")
                .await
                .expect("get")
                .expect("receipt");
            assert_eq!(receipt.status, ReceiptStatus::Completed);
            assert!(receipt.completed_at.is_some());
        });
    }

    #[test]
    fn test_concurrent_claims_elect_one_winner() {
        tokio_test::block_on(async {
            let store = Arc::new(InMemoryDedupStore::new());
            let stale = Duration::from_secs(120);

            let a = store.claim_receipt("evt-1", meta(), stale);
            let b = store.claim_receipt("evt-1", meta(), stale);
            let (a, b) = tokio::join!(a, b);

            let wins = [a.expect("a"), b.expect("b")]
                .iter()
                .filter(|won| **won)
                .count();
            assert_eq!(wins, 1);
        });
    }

    #[test]
    fn test_idempotency_key_claimed_once() {
        tokio_test::block_on(async {
            let store = InMemoryDedupStore::new();

            assert_eq!(
                store
                    .claim_idempotency_key("k1", "msg-1")
                    .await
                    .expect("claim"),
                IdempotencyClaim::New
            );
            assert_eq!(
                store
                    .claim_idempotency_key("k1", "msg-2")
                    .await
                    .expect("second claim"),
                IdempotencyClaim::Existing {
                    message_id: "msg-1".to_string()
                }
            );
        });
    }
}
