//! Store abstractions.
//!
//! All multi-document consistency is obtained via transactions scoped to a
//! single root: the conversation hierarchy, or an individual receipt /
//! idempotency-key document. No transaction spans unrelated roots, and no
//! in-process lock is held across a store call.
//!
//! Implementations live in the relay-stores crate.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    ActionResult, Conversation, ConversationState, EventLogEntry, Receipt, ReasoningIntent,
    UserMessage,
};

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: ConversationState,
        to: ConversationState,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Outcome of claiming a client idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyClaim {
    /// The key was newly written by this caller.
    New,
    /// The key was already claimed; carries the message ID that won.
    Existing { message_id: String },
}

/// Metadata recorded on a receipt when an event is claimed.
#[derive(Debug, Clone)]
pub struct ReceiptMeta {
    /// Handler claiming the event, e.g. `reasoner`
    pub handler: String,
    pub conversation_id: String,
    pub message_id: String,
}

impl ReceiptMeta {
    pub fn new(
        handler: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            handler: handler.into(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
        }
    }
}

/// Document store for the conversation hierarchy.
///
/// The conversation document owns its messages, intents, results and
/// event-log entries. Every write that advances the pipeline pairs with a
/// state-machine transition under a transaction.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation in the `RECEIVED` state. Fails with
    /// `AlreadyExists` if the id is taken.
    async fn create_conversation(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Load a conversation document.
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// In one transaction: read the current state, check `current → next`
    /// against the transition table, write `next` and bump `updated_at`.
    /// Fails with `InvalidTransition` otherwise.
    async fn transition_state(
        &self,
        id: &str,
        next: ConversationState,
    ) -> Result<Conversation, StoreError>;

    /// Persist a message under its conversation.
    async fn append_message(&self, message: &UserMessage) -> Result<(), StoreError>;

    /// Load a message by id.
    async fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<UserMessage>, StoreError>;

    /// List a conversation's messages, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<UserMessage>, StoreError>;

    /// Persist an intent under its conversation. Intents are written exactly
    /// once; a second write for the same id fails with `AlreadyExists`.
    async fn append_intent(&self, intent: &ReasoningIntent) -> Result<(), StoreError>;

    /// List a conversation's intents, oldest first.
    async fn list_intents(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ReasoningIntent>, StoreError>;

    /// Persist an action result. At most one result may exist per intent;
    /// a second write for the same intent fails with `AlreadyExists`.
    async fn append_action_result(&self, result: &ActionResult) -> Result<(), StoreError>;

    /// Existence check used by the executor as a second line of defense
    /// against duplicate execution.
    async fn find_action_result_by_intent(
        &self,
        conversation_id: &str,
        intent_id: &str,
    ) -> Result<bool, StoreError>;

    /// List a conversation's action results, oldest first.
    async fn list_action_results(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ActionResult>, StoreError>;

    /// Append an audit entry to the conversation's event log.
    async fn append_event_log(&self, entry: &EventLogEntry) -> Result<(), StoreError>;

    /// List a conversation's event-log entries, oldest first.
    async fn list_event_log(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<EventLogEntry>, StoreError>;
}

/// Process-wide deduplication store for receipts and idempotency keys.
///
/// Both token families outlive conversations; they exist only to make
/// at-least-once delivery and client retries safe.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// The central deduplication primitive. In one transaction:
    ///
    /// 1. No receipt: create `{processing, claimed_at: now, ..meta}`,
    ///    return `true`.
    /// 2. Receipt `completed`: return `false` (genuine duplicate).
    /// 3. Receipt `processing`, younger than `stale_after`: return `false`
    ///    (another worker is active).
    /// 4. Receipt `processing` and stale: bump `claimed_at`, set
    ///    `retried_at`, keep `processing`, return `true` (the original
    ///    worker crashed; claim reclaimed).
    ///
    /// Exactly one concurrent caller observes `true` per claim window.
    async fn claim_receipt(
        &self,
        event_id: &str,
        meta: ReceiptMeta,
        stale_after: Duration,
    ) -> Result<bool, StoreError>;

    /// Idempotent merge-write setting `completed` + `completed_at`. Must
    /// not fail when the receipt document is absent (write-as-upsert):
    /// a transient failure here would force a redelivery that could
    /// double-execute.
    async fn complete_receipt(&self, event_id: &str) -> Result<(), StoreError>;

    /// Load a receipt for inspection.
    async fn get_receipt(&self, event_id: &str) -> Result<Option<Receipt>, StoreError>;

    /// In one transaction: write the key if absent and return `New`, else
    /// return `Existing` with the message ID that first claimed it. Never
    /// overwrites.
    async fn claim_idempotency_key(
        &self,
        key: &str,
        message_id: &str,
    ) -> Result<IdempotencyClaim, StoreError>;
}
