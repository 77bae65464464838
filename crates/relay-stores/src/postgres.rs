//! PostgreSQL store implementations for durable deployments.
//!
//! Documents are stored as JSONB alongside the key columns the queries
//! need. Transactional operations (state transitions, receipt claims) use
//! SQL transactions with row locks to provide the single-document isolation
//! the protocol relies on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use relay_core::store::{
    ConversationStore, DedupStore, IdempotencyClaim, ReceiptMeta, StoreError,
};
use relay_core::types::{
    ActionResult, Conversation, ConversationState, EventLogEntry, Receipt, ReceiptStatus,
    ReasoningIntent, UserMessage,
};

/// PostgreSQL conversation store.
pub struct PostgresConversationStore {
    pool: PgPool,
    prefix: String,
}

impl PostgresConversationStore {
    /// Create a new store from a connection URL, initializing the schema.
    pub async fn new(
        connection_url: &str,
        table_prefix: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(connection_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let this = Self {
            pool,
            prefix: normalize_table_prefix(&table_prefix.into()),
        };
        this.init_schema().await?;
        Ok(this)
    }

    fn table(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )",
                self.table("conversations")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    doc JSONB NOT NULL
                )",
                self.table("messages")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_conversation_idx ON {0} (conversation_id, created_at ASC)",
                self.table("messages")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    doc JSONB NOT NULL
                )",
                self.table("intents")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_conversation_idx ON {0} (conversation_id, created_at ASC)",
                self.table("intents")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    intent_id TEXT NOT NULL,
                    executed_at TIMESTAMPTZ NOT NULL,
                    doc JSONB NOT NULL,
                    UNIQUE (conversation_id, intent_id)
                )",
                self.table("actions")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    event_id TEXT NOT NULL,
                    conversation_id TEXT NOT NULL,
                    recorded_at TIMESTAMPTZ NOT NULL,
                    doc JSONB NOT NULL,
                    PRIMARY KEY (conversation_id, event_id)
                )",
                self.table("events")
            ),
        ];
        for statement in statements {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for PostgresConversationStore {
    async fn create_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(id);
        let sql = format!(
            "INSERT INTO {} (id, state, created_at, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
            self.table("conversations")
        );
        let result = sqlx::query(&sql)
            .bind(&conversation.id)
            .bind(conversation.state.as_str())
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(format!("conversation {}", id)));
        }
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let sql = format!(
            "SELECT id, state, created_at, updated_at FROM {} WHERE id = $1",
            self.table("conversations")
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        row.map(decode_conversation_row).transpose()
    }

    async fn transition_state(
        &self,
        id: &str,
        next: ConversationState,
    ) -> Result<Conversation, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let select = format!(
            "SELECT id, state, created_at, updated_at FROM {} WHERE id = $1 FOR UPDATE",
            self.table("conversations")
        );
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
        let mut conversation = decode_conversation_row(row)?;

        if !conversation.state.can_transition_to(next) {
            // Dropping the transaction rolls the row lock back.
            return Err(StoreError::InvalidTransition {
                from: conversation.state,
                to: next,
            });
        }

        conversation.state = next;
        conversation.updated_at = Utc::now();
        let update = format!(
            "UPDATE {} SET state = $1, updated_at = $2 WHERE id = $3",
            self.table("conversations")
        );
        sqlx::query(&update)
            .bind(conversation.state.as_str())
            .bind(conversation.updated_at)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(conversation)
    }

    async fn append_message(&self, message: &UserMessage) -> Result<(), StoreError> {
        let doc = serde_json::to_value(message)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (id, conversation_id, created_at, doc)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
            self.table("messages")
        );
        let result = sqlx::query(&sql)
            .bind(&message.id)
            .bind(&message.conversation_id)
            .bind(message.created_at)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(format!("message {}", message.id)));
        }
        Ok(())
    }

    async fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<UserMessage>, StoreError> {
        let sql = format!(
            "SELECT doc FROM {} WHERE conversation_id = $1 AND id = $2",
            self.table("messages")
        );
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        row.map(|r| decode_doc_row(&r)).transpose()
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<UserMessage>, StoreError> {
        let sql = format!(
            "SELECT doc FROM {} WHERE conversation_id = $1 ORDER BY created_at ASC, id ASC",
            self.table("messages")
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        rows.iter().map(decode_doc_row).collect()
    }

    async fn append_intent(&self, intent: &ReasoningIntent) -> Result<(), StoreError> {
        let doc = serde_json::to_value(intent)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (id, conversation_id, created_at, doc)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
            self.table("intents")
        );
        let result = sqlx::query(&sql)
            .bind(&intent.id)
            .bind(&intent.conversation_id)
            .bind(intent.created_at)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(format!("intent {}", intent.id)));
        }
        Ok(())
    }

    async fn list_intents(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ReasoningIntent>, StoreError> {
        let sql = format!(
            "SELECT doc FROM {} WHERE conversation_id = $1 ORDER BY created_at ASC, id ASC",
            self.table("intents")
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        rows.iter().map(decode_doc_row).collect()
    }

    async fn append_action_result(&self, result: &ActionResult) -> Result<(), StoreError> {
        let doc = serde_json::to_value(result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (id, conversation_id, intent_id, executed_at, doc)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT DO NOTHING",
            self.table("actions")
        );
        let outcome = sqlx::query(&sql)
            .bind(&result.id)
            .bind(&result.conversation_id)
            .bind(&result.intent_id)
            .bind(result.executed_at)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if outcome.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(format!(
                "action result for intent {}",
                result.intent_id
            )));
        }
        Ok(())
    }

    async fn find_action_result_by_intent(
        &self,
        conversation_id: &str,
        intent_id: &str,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE conversation_id = $1 AND intent_id = $2)",
            self.table("actions")
        );
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(intent_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        row.try_get(0)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn list_action_results(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ActionResult>, StoreError> {
        let sql = format!(
            "SELECT doc FROM {} WHERE conversation_id = $1 ORDER BY executed_at ASC, id ASC",
            self.table("actions")
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        rows.iter().map(decode_doc_row).collect()
    }

    async fn append_event_log(&self, entry: &EventLogEntry) -> Result<(), StoreError> {
        let doc = serde_json::to_value(entry)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        // Keyed by event ID; replays no-op.
        let sql = format!(
            "INSERT INTO {} (event_id, conversation_id, recorded_at, doc)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT DO NOTHING",
            self.table("events")
        );
        sqlx::query(&sql)
            .bind(&entry.event_id)
            .bind(&entry.conversation_id)
            .bind(entry.recorded_at)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn list_event_log(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<EventLogEntry>, StoreError> {
        let sql = format!(
            "SELECT doc FROM {} WHERE conversation_id = $1 ORDER BY recorded_at ASC, event_id ASC",
            self.table("events")
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        rows.iter().map(decode_doc_row).collect()
    }
}

/// PostgreSQL deduplication store.
pub struct PostgresDedupStore {
    pool: PgPool,
    prefix: String,
}

impl PostgresDedupStore {
    /// Create a new store from a connection URL, initializing the schema.
    pub async fn new(
        connection_url: &str,
        table_prefix: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(connection_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let this = Self {
            pool,
            prefix: normalize_table_prefix(&table_prefix.into()),
        };
        this.init_schema().await?;
        Ok(this)
    }

    fn table(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    event_id TEXT PRIMARY KEY,
                    handler TEXT NOT NULL,
                    conversation_id TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    claimed_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ NULL,
                    retried_at TIMESTAMPTZ NULL
                )",
                self.table("receipts")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    client_key TEXT PRIMARY KEY,
                    message_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )",
                self.table("idempotency_keys")
            ),
        ];
        for statement in statements {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DedupStore for PostgresDedupStore {
    async fn claim_receipt(
        &self,
        event_id: &str,
        meta: ReceiptMeta,
        stale_after: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let insert = format!(
            "INSERT INTO {} (event_id, handler, conversation_id, message_id, status, claimed_at)
             VALUES ($1, $2, $3, $4, 'processing', $5)
             ON CONFLICT (event_id) DO NOTHING",
            self.table("receipts")
        );
        let inserted = sqlx::query(&insert)
            .bind(event_id)
            .bind(&meta.handler)
            .bind(&meta.conversation_id)
            .bind(&meta.message_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if inserted.rows_affected() == 1 {
            tx.commit()
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            return Ok(true);
        }

        let select = format!(
            "SELECT status, claimed_at FROM {} WHERE event_id = $1 FOR UPDATE",
            self.table("receipts")
        );
        let row = sqlx::query(&select)
            .bind(event_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let status_raw: String = row
            .try_get("status")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let claimed_at: DateTime<Utc> = row
            .try_get("claimed_at")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let Some(status) = ReceiptStatus::parse(&status_raw) else {
            tracing::error!(
                event_id = %event_id,
                status = %status_raw,
                "receipt has unknown status; refusing claim"
            );
            return Ok(false);
        };

        match status {
            ReceiptStatus::Completed => Ok(false),
            ReceiptStatus::Processing => {
                let stale = chrono::Duration::from_std(stale_after)
                    .map_err(|e| StoreError::Internal(e.to_string()))?;
                if now.signed_duration_since(claimed_at) < stale {
                    return Ok(false);
                }
                let update = format!(
                    "UPDATE {} SET claimed_at = $1, retried_at = $1 WHERE event_id = $2",
                    self.table("receipts")
                );
                sqlx::query(&update)
                    .bind(now)
                    .bind(event_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
                tx.commit()
                    .await
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
                tracing::warn!(event_id = %event_id, "stale receipt reclaimed");
                Ok(true)
            }
        }
    }

    async fn complete_receipt(&self, event_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO {} (event_id, handler, conversation_id, message_id, status, claimed_at, completed_at)
             VALUES ($1, '', '', '', 'completed', $2, $2)
             ON CONFLICT (event_id)
             DO UPDATE SET status = 'completed', completed_at = $2",
            self.table("receipts")
        );
        sqlx::query(&sql)
            .bind(event_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn get_receipt(&self, event_id: &str) -> Result<Option<Receipt>, StoreError> {
        let sql = format!(
            "SELECT event_id, handler, conversation_id, message_id, status, claimed_at,
                    completed_at, retried_at
             FROM {} WHERE event_id = $1",
            self.table("receipts")
        );
        let Some(row) = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?
        else {
            return Ok(None);
        };

        let status_raw: String = row
            .try_get("status")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let status = ReceiptStatus::parse(&status_raw).ok_or_else(|| {
            StoreError::Serialization(format!("unknown receipt status '{}'", status_raw))
        })?;

        Ok(Some(Receipt {
            event_id: row
                .try_get("event_id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            handler: row
                .try_get("handler")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            conversation_id: row
                .try_get("conversation_id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            message_id: row
                .try_get("message_id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            status,
            claimed_at: row
                .try_get("claimed_at")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            completed_at: row
                .try_get("completed_at")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            retried_at: row
                .try_get("retried_at")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        }))
    }

    async fn claim_idempotency_key(
        &self,
        key: &str,
        message_id: &str,
    ) -> Result<IdempotencyClaim, StoreError> {
        let insert = format!(
            "INSERT INTO {} (client_key, message_id, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (client_key) DO NOTHING",
            self.table("idempotency_keys")
        );
        let inserted = sqlx::query(&insert)
            .bind(key)
            .bind(message_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if inserted.rows_affected() == 1 {
            return Ok(IdempotencyClaim::New);
        }

        let select = format!(
            "SELECT message_id FROM {} WHERE client_key = $1",
            self.table("idempotency_keys")
        );
        let row = sqlx::query(&select)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let existing: String = row
            .try_get("message_id")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(IdempotencyClaim::Existing {
            message_id: existing,
        })
    }
}

fn decode_conversation_row(row: sqlx::postgres::PgRow) -> Result<Conversation, StoreError> {
    let state_raw: String = row
        .try_get("state")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let state = ConversationState::parse(&state_raw).ok_or_else(|| {
        StoreError::Serialization(format!("unknown conversation state '{}'", state_raw))
    })?;
    Ok(Conversation {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        state,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

fn decode_doc_row<T: serde::de::DeserializeOwned>(
    row: &sqlx::postgres::PgRow,
) -> Result<T, StoreError> {
    let value: serde_json::Value = row
        .try_get("doc")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn normalize_table_prefix(raw: &str) -> String {
    let candidate = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string();
    if candidate.is_empty() {
        "relay".to_string()
    } else {
        candidate
    }
}
