//! Configuration loading and validation.
//!
//! The pipeline's tunables are deliberately few: topic names, the receipt
//! stale threshold, the bus retry budget, and the store backend handles.
//! A YAML file supplies them; the enumerated environment variables
//! (`TOPIC_REASONING`, `TOPIC_ACTION`, `RECEIPT_STALE_THRESHOLD_MS`)
//! override the file for platform-supplied deployments.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub app: AppConfig,
    pub http: HttpConfig,
    pub topics: TopicsConfig,
    pub receipts: ReceiptsConfig,
    pub bus: BusConfig,
    pub stores: StoresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "relay".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Logical topic names and their dead-letter companions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub reasoning: String,
    pub action: String,
    pub reasoning_dead_letter: String,
    pub action_dead_letter: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            reasoning: "reasoning-requested".to_string(),
            action: "action-requested".to_string(),
            reasoning_dead_letter: "reasoning-dead-letter".to_string(),
            action_dead_letter: "action-dead-letter".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptsConfig {
    /// Age in milliseconds past which a `processing` receipt is reclaimable.
    pub stale_threshold_ms: u64,
}

impl Default for ReceiptsConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: 120_000,
        }
    }
}

impl ReceiptsConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Max delivery attempts per subscription before dead-lettering.
    pub max_delivery_attempts: u32,
    /// Retention the transport applies to dead-letter topics.
    pub dead_letter_retention_days: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            dead_letter_retention_days: 7,
        }
    }
}

/// Backend selection for one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSpec {
    /// `in_memory`, `postgres`, or (dedup store only) `redis`
    pub backend: String,
    pub connection_url: Option<String>,
    pub table_prefix: Option<String>,
    pub key_prefix: Option<String>,
}

impl Default for StoreSpec {
    fn default() -> Self {
        Self {
            backend: "in_memory".to_string(),
            connection_url: None,
            table_prefix: None,
            key_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresConfig {
    pub conversation: StoreSpec,
    pub dedup: StoreSpec,
}

const CONVERSATION_BACKENDS: [&str; 2] = ["in_memory", "postgres"];
const DEDUP_BACKENDS: [&str; 3] = ["in_memory", "postgres", "redis"];

/// Load configuration from a YAML file, apply environment overrides, and
/// validate.
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut config: RelayConfig = serde_yaml::from_str(&content)?;
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Apply the enumerated environment overrides.
pub fn apply_env_overrides(config: &mut RelayConfig) {
    if let Ok(topic) = std::env::var("TOPIC_REASONING") {
        if !topic.trim().is_empty() {
            config.topics.reasoning = topic;
        }
    }
    if let Ok(topic) = std::env::var("TOPIC_ACTION") {
        if !topic.trim().is_empty() {
            config.topics.action = topic;
        }
    }
    if let Ok(raw) = std::env::var("RECEIPT_STALE_THRESHOLD_MS") {
        if let Ok(ms) = raw.trim().parse::<u64>() {
            config.receipts.stale_threshold_ms = ms;
        }
    }
}

/// Validate a configuration document.
pub fn validate_config(config: &RelayConfig) -> Result<(), ConfigError> {
    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }
    if config.http.listen.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "http.listen must not be empty".to_string(),
        ));
    }

    for (label, topic) in [
        ("topics.reasoning", &config.topics.reasoning),
        ("topics.action", &config.topics.action),
        (
            "topics.reasoning_dead_letter",
            &config.topics.reasoning_dead_letter,
        ),
        ("topics.action_dead_letter", &config.topics.action_dead_letter),
    ] {
        if topic.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{} must not be empty", label)));
        }
    }
    if config.topics.reasoning == config.topics.action {
        return Err(ConfigError::Invalid(
            "topics.reasoning and topics.action must differ".to_string(),
        ));
    }

    if config.receipts.stale_threshold_ms == 0 {
        return Err(ConfigError::Invalid(
            "receipts.stale_threshold_ms must be > 0".to_string(),
        ));
    }
    if config.bus.max_delivery_attempts == 0 {
        return Err(ConfigError::Invalid(
            "bus.max_delivery_attempts must be > 0".to_string(),
        ));
    }

    validate_store_spec(
        "stores.conversation",
        &config.stores.conversation,
        &CONVERSATION_BACKENDS,
    )?;
    validate_store_spec("stores.dedup", &config.stores.dedup, &DEDUP_BACKENDS)?;

    Ok(())
}

fn validate_store_spec(
    label: &str,
    spec: &StoreSpec,
    known_backends: &[&str],
) -> Result<(), ConfigError> {
    let backend = spec.backend.trim().to_ascii_lowercase();
    if !known_backends.contains(&backend.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "{}.backend '{}' not one of {:?}",
            label, spec.backend, known_backends
        )));
    }
    if backend != "in_memory" && spec.connection_url.as_deref().unwrap_or("").trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{}.connection_url required for backend '{}'",
            label, backend
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.receipts.stale_threshold(), Duration::from_secs(120));
    }

    #[test]
    fn test_parse_minimal_yaml_fills_defaults() {
        let yaml = "app:\n  name: relay-test\n";
        let config: RelayConfig = serde_yaml::from_str(yaml).expect("parse");

        assert_eq!(config.app.name, "relay-test");
        assert_eq!(config.topics.reasoning, "reasoning-requested");
        assert_eq!(config.bus.max_delivery_attempts, 5);
        assert_eq!(config.stores.dedup.backend, "in_memory");
    }

    #[test]
    fn test_remote_backend_requires_connection_url() {
        let mut config = RelayConfig::default();
        config.stores.conversation.backend = "postgres".to_string();

        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));

        config.stores.conversation.connection_url =
            Some("postgres://localhost/relay".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_redis_backend_is_dedup_only() {
        let mut config = RelayConfig::default();
        config.stores.conversation.backend = "redis".to_string();
        config.stores.conversation.connection_url = Some("redis://localhost".to_string());

        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_identical_topics_are_rejected() {
        let mut config = RelayConfig::default();
        config.topics.action = config.topics.reasoning.clone();

        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }
}
