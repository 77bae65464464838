//! # Relay Runtime
//!
//! The consumer side of the pipeline: the reasoner and executor handlers,
//! the subscription runner that drives them against a topic, the
//! deterministic reasoning/tool functions a deployment can replace, and the
//! bootstrap that assembles stores, bus and workers from configuration.
//!
//! Workers are stateless. Concurrent delivery of two events for the same
//! conversation is legal; correctness comes from the store's transactional
//! transitions and the receipt claims, never from in-process locks.

mod bootstrap;
mod executor;
mod functions;
mod reasoner;
mod runner;
mod transitions;

pub use bootstrap::{build_conversation_store, build_dedup_store, BootstrapError, RuntimeApp};
pub use executor::ExecutorHandler;
pub use functions::{BuiltinToolbox, KeywordReasoner, ReasoningFn, ToolFn, ToolOutcome};
pub use reasoner::ReasonerHandler;
pub use runner::{EventHandler, HandlerOutcome, Runner};
pub use transitions::transition_forward;

use thiserror::Error;

use relay_core::bus::BusError;
use relay_core::store::StoreError;

/// Worker errors. Raising one nacks the delivery so the bus redelivers;
/// the stale-receipt reclamation window guarantees forward progress.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}
