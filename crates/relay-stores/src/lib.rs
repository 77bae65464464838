//! # Relay Stores
//!
//! Backends for the relay-core store and bus abstractions:
//! - In-memory stores for development and testing
//! - PostgreSQL stores for durable deployments
//! - A Redis deduplication store for receipt/key tokens
//! - An in-process topic bus with retry and dead-letter routing

mod bus;
mod memory;
mod postgres;
mod redis_dedup;

pub use bus::InProcessBus;
pub use memory::{InMemoryConversationStore, InMemoryDedupStore};
pub use postgres::{PostgresConversationStore, PostgresDedupStore};
pub use redis_dedup::RedisDedupStore;
