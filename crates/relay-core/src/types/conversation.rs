//! Conversation type and its state machine.
//!
//! The state set is closed. Every state write must pass the allowed-transition
//! table, enforced inside a store transaction; an illegal write fails the
//! enclosing transaction with `StoreError::InvalidTransition`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation lifecycle states.
///
/// Observable states progress monotonically along the permitted graph; no
/// observer can see a state that is not reachable from the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Received,
    ReasoningRequested,
    IntentValidated,
    ActionRequested,
    ActionCompleted,
    FailedValidation,
    FailedExecution,
}

impl ConversationState {
    /// Allowed successors per the authoritative transition table.
    pub fn allowed_next(self) -> &'static [ConversationState] {
        use ConversationState::*;
        match self {
            Received => &[ReasoningRequested],
            ReasoningRequested => &[IntentValidated, FailedValidation],
            IntentValidated => &[ActionRequested],
            ActionRequested => &[ActionCompleted, FailedExecution],
            ActionCompleted | FailedValidation | FailedExecution => &[],
        }
    }

    /// Check whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ConversationState) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Check if the conversation has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Wire label, e.g. `REASONING_REQUESTED`.
    pub fn as_str(self) -> &'static str {
        use ConversationState::*;
        match self {
            Received => "RECEIVED",
            ReasoningRequested => "REASONING_REQUESTED",
            IntentValidated => "INTENT_VALIDATED",
            ActionRequested => "ACTION_REQUESTED",
            ActionCompleted => "ACTION_COMPLETED",
            FailedValidation => "FAILED_VALIDATION",
            FailedExecution => "FAILED_EXECUTION",
        }
    }

    /// Parse a wire label back into a state.
    pub fn parse(raw: &str) -> Option<ConversationState> {
        use ConversationState::*;
        match raw {
            "RECEIVED" => Some(Received),
            "REASONING_REQUESTED" => Some(ReasoningRequested),
            "INTENT_VALIDATED" => Some(IntentValidated),
            "ACTION_REQUESTED" => Some(ActionRequested),
            "ACTION_COMPLETED" => Some(ActionCompleted),
            "FAILED_VALIDATION" => Some(FailedValidation),
            "FAILED_EXECUTION" => Some(FailedExecution),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation - the root document of the pipeline.
///
/// Created by the ingress; mutated only via the transition protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique identifier (UUID)
    pub id: String,
    /// Current state from the closed set
    pub state: ConversationState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new conversation in the `RECEIVED` state.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: ConversationState::Received,
            created_at: now,
            updated_at: now,
        }
    }
}
