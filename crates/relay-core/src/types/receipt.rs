//! Event receipts and idempotency-key records.
//!
//! Both are process-wide deduplication tokens, independent of any
//! conversation's lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Receipt lifecycle. Receipts progress only `processing → completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Processing,
    Completed,
}

impl ReceiptStatus {
    pub fn parse(raw: &str) -> Option<ReceiptStatus> {
        match raw {
            "processing" => Some(ReceiptStatus::Processing),
            "completed" => Some(ReceiptStatus::Completed),
            _ => None,
        }
    }
}

/// Per-event deduplication token. One receipt exists per logical event
/// delivery family; a `processing` receipt older than the stale threshold is
/// eligible for reclamation by a redelivered copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// The claimed event's unique ID
    pub event_id: String,
    /// Handler that claimed the event, e.g. `reasoner`
    pub handler: String,
    /// Conversation the event belongs to
    pub conversation_id: String,
    /// Message the event belongs to
    pub message_id: String,
    /// Current lifecycle status
    pub status: ReceiptStatus,
    /// When the current claim was taken
    pub claimed_at: DateTime<Utc>,
    /// When the claim was completed, if it was
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// When a stale claim was last reclaimed, if ever
    #[serde(default)]
    pub retried_at: Option<DateTime<Utc>>,
}

/// Record of a client idempotency key, keyed by the key itself. Stores the
/// message ID that first claimed it; never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyKeyRecord {
    /// The client-supplied key
    pub key: String,
    /// Message that won the claim
    pub message_id: String,
    /// Claim timestamp
    pub created_at: DateTime<Utc>,
}
