//! Replay-tolerant state transitions.

use std::sync::Arc;

use relay_core::store::{ConversationStore, StoreError};
use relay_core::types::ConversationState;

use crate::RuntimeError;

fn progress_rank(state: ConversationState) -> u8 {
    use ConversationState::*;
    match state {
        Received => 0,
        ReasoningRequested => 1,
        IntentValidated => 2,
        ActionRequested => 3,
        ActionCompleted | FailedValidation | FailedExecution => 4,
    }
}

/// Attempt `current → next`, tolerating replays that resume past the
/// target.
///
/// A redelivered event reclaims its receipt and replays its handler from
/// the beginning, so the conversation may already sit at, or beyond, the
/// state the handler is about to write. An `InvalidTransition` whose
/// current state is at least as far along the graph as `next` is therefore
/// not an error; anything else bubbles.
pub async fn transition_forward(
    store: &Arc<dyn ConversationStore>,
    conversation_id: &str,
    next: ConversationState,
) -> Result<(), RuntimeError> {
    match store.transition_state(conversation_id, next).await {
        Ok(_) => Ok(()),
        Err(StoreError::InvalidTransition { from, to }) if progress_rank(from) >= progress_rank(to) => {
            tracing::debug!(
                conversation_id = %conversation_id,
                current = %from,
                target = %to,
                "transition already applied by an earlier attempt"
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_stores::InMemoryConversationStore;

    #[test]
    fn test_transition_forward_applies_legal_transition() {
        tokio_test::block_on(async {
            let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
            store.create_conversation("conv-1").await.expect("create");

            transition_forward(&store, "conv-1", ConversationState::ReasoningRequested)
                .await
                .expect("legal transition");
            let conversation = store
                .get_conversation("conv-1")
                .await
                .expect("get")
                .expect("conversation");
            assert_eq!(conversation.state, ConversationState::ReasoningRequested);
        });
    }

    #[test]
    fn test_transition_forward_tolerates_replayed_target() {
        tokio_test::block_on(async {
            let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
            store.create_conversation("conv-1").await.expect("create");
            store
                .transition_state("conv-1", ConversationState::ReasoningRequested)
                .await
                .expect("advance");
            store
                .transition_state("conv-1", ConversationState::IntentValidated)
                .await
                .expect("advance");

            // A replay attempting the transition it already made.
            transition_forward(&store, "conv-1", ConversationState::IntentValidated)
                .await
                .expect("tolerated");

            // A replay resuming past the target.
            store
                .transition_state("conv-1", ConversationState::ActionRequested)
                .await
                .expect("advance");
            transition_forward(&store, "conv-1", ConversationState::IntentValidated)
                .await
                .expect("tolerated past target");
        });
    }

    #[test]
    fn test_transition_forward_rejects_backward_jump() {
        tokio_test::block_on(async {
            let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
            store.create_conversation("conv-1").await.expect("create");

            // RECEIVED is behind INTENT_VALIDATED; this is a genuine
            // protocol violation, not a replay.
            let err = transition_forward(&store, "conv-1", ConversationState::IntentValidated)
                .await
                .expect_err("must bubble");
            assert!(matches!(
                err,
                RuntimeError::Store(StoreError::InvalidTransition { .. })
            ));
        });
    }
}
