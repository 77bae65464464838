//! Redis deduplication store.
//!
//! Receipts live as hashes, idempotency keys as `SET NX` strings. The claim
//! protocol must observe and update the receipt atomically across competing
//! workers, so it runs as a server-side script.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use relay_core::store::{DedupStore, IdempotencyClaim, ReceiptMeta, StoreError};
use relay_core::types::{Receipt, ReceiptStatus};

// Returns 1 on a fresh claim, 2 on a stale reclaim, 0 on a duplicate, and
// -1 when the stored status is outside {processing, completed}.
const CLAIM_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  redis.call('HSET', KEYS[1],
    'handler', ARGV[4],
    'conversation_id', ARGV[5],
    'message_id', ARGV[6],
    'status', 'processing',
    'claimed_at', ARGV[2],
    'claimed_at_ms', ARGV[1])
  return 1
end
if status == 'completed' then
  return 0
end
if status == 'processing' then
  local claimed = tonumber(redis.call('HGET', KEYS[1], 'claimed_at_ms') or '0')
  if tonumber(ARGV[1]) - claimed < tonumber(ARGV[3]) then
    return 0
  end
  redis.call('HSET', KEYS[1],
    'claimed_at', ARGV[2],
    'claimed_at_ms', ARGV[1],
    'retried_at', ARGV[2])
  return 2
end
return -1
"#;

/// Redis-backed deduplication store.
pub struct RedisDedupStore {
    client: redis::Client,
    key_prefix: String,
    claim_script: redis::Script,
}

impl RedisDedupStore {
    /// Create a new store from a connection URL.
    pub fn new(connection_url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(connection_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            claim_script: redis::Script::new(CLAIM_SCRIPT),
        })
    }

    fn receipt_key(&self, event_id: &str) -> String {
        format!("{}:receipt:{}", self.key_prefix, event_id)
    }

    fn idempotency_key(&self, key: &str) -> String {
        format!("{}:idemkey:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn claim_receipt(
        &self,
        event_id: &str,
        meta: ReceiptMeta,
        stale_after: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let now = Utc::now();
        let verdict: i64 = self
            .claim_script
            .key(self.receipt_key(event_id))
            .arg(now.timestamp_millis())
            .arg(now.to_rfc3339())
            .arg(stale_after.as_millis() as i64)
            .arg(&meta.handler)
            .arg(&meta.conversation_id)
            .arg(&meta.message_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        match verdict {
            1 => Ok(true),
            2 => {
                tracing::warn!(event_id = %event_id, "stale receipt reclaimed");
                Ok(true)
            }
            0 => Ok(false),
            _ => {
                tracing::error!(
                    event_id = %event_id,
                    "receipt has unknown status; refusing claim"
                );
                Ok(false)
            }
        }
    }

    async fn complete_receipt(&self, event_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let now = Utc::now();
        // HSET materializes the hash when absent: the merge-write contract.
        conn.hset_multiple::<_, _, _, ()>(
            self.receipt_key(event_id),
            &[
                ("status", "completed".to_string()),
                ("completed_at", now.to_rfc3339()),
            ],
        )
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn get_receipt(&self, event_id: &str) -> Result<Option<Receipt>, StoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(self.receipt_key(event_id))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_receipt_hash(event_id, &fields).map(Some)
    }

    async fn claim_idempotency_key(
        &self,
        key: &str,
        message_id: &str,
    ) -> Result<IdempotencyClaim, StoreError> {
        let mut conn = self.connection().await?;
        let record = serde_json::json!({
            "message_id": message_id,
            "created_at": Utc::now().to_rfc3339(),
        });
        let payload = record.to_string();

        let won: bool = conn
            .set_nx(self.idempotency_key(key), payload)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if won {
            return Ok(IdempotencyClaim::New);
        }

        let existing: Option<String> = conn
            .get(self.idempotency_key(key))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let existing = existing
            .ok_or_else(|| StoreError::Internal(format!("idempotency key '{}' vanished", key)))?;
        let value: serde_json::Value = serde_json::from_str(&existing)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let message_id = value
            .get("message_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                StoreError::Serialization(format!(
                    "idempotency key '{}' record missing message_id",
                    key
                ))
            })?;
        Ok(IdempotencyClaim::Existing {
            message_id: message_id.to_string(),
        })
    }
}

fn decode_receipt_hash(
    event_id: &str,
    fields: &HashMap<String, String>,
) -> Result<Receipt, StoreError> {
    let status_raw = fields
        .get("status")
        .ok_or_else(|| StoreError::Serialization("receipt hash missing status".to_string()))?;
    let status = ReceiptStatus::parse(status_raw).ok_or_else(|| {
        StoreError::Serialization(format!("unknown receipt status '{}'", status_raw))
    })?;

    Ok(Receipt {
        event_id: event_id.to_string(),
        handler: fields.get("handler").cloned().unwrap_or_default(),
        conversation_id: fields.get("conversation_id").cloned().unwrap_or_default(),
        message_id: fields.get("message_id").cloned().unwrap_or_default(),
        status,
        claimed_at: parse_timestamp(fields.get("claimed_at"))?.unwrap_or_else(Utc::now),
        completed_at: parse_timestamp(fields.get("completed_at"))?,
        retried_at: parse_timestamp(fields.get("retried_at"))?,
    })
}

fn parse_timestamp(raw: Option<&String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_receipt_hash_round_trips_fields() {
        let now = Utc::now();
        let fields = HashMap::from([
            ("handler".to_string(), "executor".to_string()),
            ("conversation_id".to_string(), "conv-1".to_string()),
            ("message_id".to_string(), "msg-1".to_string()),
            ("status".to_string(), "processing".to_string()),
            ("claimed_at".to_string(), now.to_rfc3339()),
        ]);

        let receipt = decode_receipt_hash("evt-1", &fields).expect("decode");
        assert_eq!(receipt.event_id, "evt-1");
        assert_eq!(receipt.handler, "executor");
        assert_eq!(receipt.status, ReceiptStatus::Processing);
        assert!(receipt.completed_at.is_none());
        assert!(receipt.retried_at.is_none());
    }

    #[test]
    fn test_decode_receipt_hash_rejects_unknown_status() {
        let fields = HashMap::from([("status".to_string(), "haunted".to_string())]);
        assert!(matches!(
            decode_receipt_hash("evt-1", &fields),
            Err(StoreError::Serialization(_))
        ));
    }
}
