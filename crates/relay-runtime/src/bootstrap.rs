//! Runtime assembly.
//!
//! Builds stores from their configured backends, registers the pipeline
//! topics on the in-process bus, and spawns the worker runners. The store
//! and bus handles are injected into every handler explicitly; nothing here
//! is process-global.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use relay_config::{ConfigError, RelayConfig, StoreSpec};
use relay_core::bus::MessageBus;
use relay_core::store::{ConversationStore, DedupStore, StoreError};
use relay_stores::{
    InMemoryConversationStore, InMemoryDedupStore, InProcessBus, PostgresConversationStore,
    PostgresDedupStore, RedisDedupStore,
};

use crate::executor::ExecutorHandler;
use crate::functions::{BuiltinToolbox, KeywordReasoner, ReasoningFn, ToolFn};
use crate::reasoner::ReasonerHandler;
use crate::runner::Runner;

/// Errors raised while assembling the runtime.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unsupported {store} store backend: {backend}")]
    UnsupportedStoreBackend { store: String, backend: String },
    #[error("missing connection url for {store} store")]
    MissingStoreConnectionUrl { store: String },
}

fn require_connection_url(spec: &StoreSpec, store: &str) -> Result<String, BootstrapError> {
    spec.connection_url
        .clone()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| BootstrapError::MissingStoreConnectionUrl {
            store: store.to_string(),
        })
}

/// Build the conversation store named by a backend spec.
pub async fn build_conversation_store(
    spec: &StoreSpec,
) -> Result<Arc<dyn ConversationStore>, BootstrapError> {
    match spec.backend.trim().to_ascii_lowercase().as_str() {
        "in_memory" | "memory" => Ok(Arc::new(InMemoryConversationStore::new())),
        "postgres" | "postgresql" | "pgsql" => {
            let url = require_connection_url(spec, "conversation")?;
            let prefix = spec.table_prefix.clone().unwrap_or_else(|| "relay".to_string());
            let store = PostgresConversationStore::new(&url, prefix).await?;
            Ok(Arc::new(store))
        }
        backend => Err(BootstrapError::UnsupportedStoreBackend {
            store: "conversation".to_string(),
            backend: backend.to_string(),
        }),
    }
}

/// Build the deduplication store named by a backend spec.
pub async fn build_dedup_store(spec: &StoreSpec) -> Result<Arc<dyn DedupStore>, BootstrapError> {
    match spec.backend.trim().to_ascii_lowercase().as_str() {
        "in_memory" | "memory" => Ok(Arc::new(InMemoryDedupStore::new())),
        "postgres" | "postgresql" | "pgsql" => {
            let url = require_connection_url(spec, "dedup")?;
            let prefix = spec.table_prefix.clone().unwrap_or_else(|| "relay".to_string());
            let store = PostgresDedupStore::new(&url, prefix).await?;
            Ok(Arc::new(store))
        }
        "redis" => {
            let url = require_connection_url(spec, "dedup")?;
            let prefix = spec.key_prefix.clone().unwrap_or_else(|| "relay".to_string());
            let store = RedisDedupStore::new(&url, prefix)?;
            Ok(Arc::new(store))
        }
        backend => Err(BootstrapError::UnsupportedStoreBackend {
            store: "dedup".to_string(),
            backend: backend.to_string(),
        }),
    }
}

/// The assembled pipeline: stores, bus, and configuration.
pub struct RuntimeApp {
    pub config: RelayConfig,
    pub conversations: Arc<dyn ConversationStore>,
    pub dedup: Arc<dyn DedupStore>,
    pub bus: Arc<InProcessBus>,
}

impl RuntimeApp {
    /// Build stores and bus from configuration.
    pub async fn from_config(config: RelayConfig) -> Result<Self, BootstrapError> {
        let conversations = build_conversation_store(&config.stores.conversation).await?;
        let dedup = build_dedup_store(&config.stores.dedup).await?;

        let bus = InProcessBus::new(config.bus.max_delivery_attempts);
        bus.register_topic(
            &config.topics.reasoning,
            Some(&config.topics.reasoning_dead_letter),
        );
        bus.register_topic(&config.topics.action, Some(&config.topics.action_dead_letter));

        Ok(Self {
            config,
            conversations,
            dedup,
            bus: Arc::new(bus),
        })
    }

    /// The bus as the abstract transport handle handlers take.
    pub fn message_bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    /// Spawn the reasoner and executor runners with the supplied functions.
    pub fn spawn_workers(
        &self,
        reasoning: Arc<dyn ReasoningFn>,
        tools: Arc<dyn ToolFn>,
    ) -> Vec<JoinHandle<()>> {
        let stale_threshold = self.config.receipts.stale_threshold();

        let reasoner = Arc::new(ReasonerHandler::new(
            self.conversations.clone(),
            self.dedup.clone(),
            self.message_bus(),
            reasoning,
            self.config.topics.action.clone(),
            stale_threshold,
        ));
        let executor = Arc::new(ExecutorHandler::new(
            self.conversations.clone(),
            self.dedup.clone(),
            tools,
            stale_threshold,
        ));

        vec![
            tokio::spawn(
                Runner::new(self.message_bus(), self.config.topics.reasoning.clone(), reasoner)
                    .run(),
            ),
            tokio::spawn(
                Runner::new(self.message_bus(), self.config.topics.action.clone(), executor)
                    .run(),
            ),
        ]
    }

    /// Spawn workers with the built-in deterministic functions.
    pub fn spawn_default_workers(&self) -> Vec<JoinHandle<()>> {
        self.spawn_workers(Arc::new(KeywordReasoner), Arc::new(BuiltinToolbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_api::{IngressService, SubmitOutcome};
    use relay_core::types::ConversationState;
    use std::time::Duration;

    async fn terminal_state(
        app: &RuntimeApp,
        conversation_id: &str,
    ) -> Option<ConversationState> {
        // Poll the conversation document the way a client would.
        for _ in 0..200 {
            let conversation = app
                .conversations
                .get_conversation(conversation_id)
                .await
                .expect("get")
                .expect("conversation");
            if conversation.state.is_terminal() {
                return Some(conversation.state);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[test]
    fn test_pipeline_happy_path_search() {
        tokio_test::block_on(async {
            let app = RuntimeApp::from_config(RelayConfig::default())
                .await
                .expect("bootstrap");
            let workers = app.spawn_default_workers();

            let ingress = IngressService::new(
                app.conversations.clone(),
                app.dedup.clone(),
                app.message_bus(),
                app.config.topics.reasoning.clone(),
            );
            let outcome = ingress
                .submit_message(&serde_json::json!({"content": "search for cats"}), None)
                .await
                .expect("submit");
            let SubmitOutcome::Accepted {
                conversation_id,
                state,
                ..
            } = outcome
            else {
                panic!("expected accepted outcome");
            };
            assert_eq!(state, ConversationState::ReasoningRequested);

            let terminal = terminal_state(&app, &conversation_id)
                .await
                .expect("pipeline must terminate");
            assert_eq!(terminal, ConversationState::ActionCompleted);

            let intents = app
                .conversations
                .list_intents(&conversation_id)
                .await
                .expect("intents");
            assert_eq!(intents.len(), 1);
            assert!(intents[0].valid);
            assert_eq!(intents[0].action, "search");

            let results = app
                .conversations
                .list_action_results(&conversation_id)
                .await
                .expect("results");
            assert_eq!(results.len(), 1);
            assert!(results[0].success);
            assert_eq!(results[0].result["tool"], "search");

            for worker in workers {
                worker.abort();
            }
        });
    }

    #[test]
    fn test_pipeline_invalid_reasoning_fails_validation() {
        tokio_test::block_on(async {
            let app = RuntimeApp::from_config(RelayConfig::default())
                .await
                .expect("bootstrap");
            let workers = app.spawn_default_workers();

            let ingress = IngressService::new(
                app.conversations.clone(),
                app.dedup.clone(),
                app.message_bus(),
                app.config.topics.reasoning.clone(),
            );
            let outcome = ingress
                .submit_message(&serde_json::json!({"content": "dance for me"}), None)
                .await
                .expect("submit");
            let SubmitOutcome::Accepted {
                conversation_id, ..
            } = outcome
            else {
                panic!("expected accepted outcome");
            };

            let terminal = terminal_state(&app, &conversation_id)
                .await
                .expect("pipeline must terminate");
            assert_eq!(terminal, ConversationState::FailedValidation);

            let intents = app
                .conversations
                .list_intents(&conversation_id)
                .await
                .expect("intents");
            assert_eq!(intents.len(), 1);
            assert!(!intents[0].valid);

            // Nothing reached the action stage.
            let results = app
                .conversations
                .list_action_results(&conversation_id)
                .await
                .expect("results");
            assert!(results.is_empty());

            for worker in workers {
                worker.abort();
            }
        });
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        tokio_test::block_on(async {
            let spec = StoreSpec {
                backend: "cassandra".to_string(),
                ..StoreSpec::default()
            };
            assert!(matches!(
                build_conversation_store(&spec).await,
                Err(BootstrapError::UnsupportedStoreBackend { .. })
            ));
            assert!(matches!(
                build_dedup_store(&spec).await,
                Err(BootstrapError::UnsupportedStoreBackend { .. })
            ));
        });
    }

    #[test]
    fn test_remote_backend_without_url_is_rejected() {
        tokio_test::block_on(async {
            let spec = StoreSpec {
                backend: "postgres".to_string(),
                ..StoreSpec::default()
            };
            assert!(matches!(
                build_conversation_store(&spec).await,
                Err(BootstrapError::MissingStoreConnectionUrl { .. })
            ));
        });
    }
}
