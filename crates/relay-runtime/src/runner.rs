//! Subscription runner.
//!
//! Bridges a topic subscription to a handler: pull, invoke, and nack on
//! failure so the transport redelivers. Poison and duplicate outcomes are
//! acknowledged silently; only a raised error sends a delivery back.

use std::sync::Arc;

use async_trait::async_trait;

use relay_core::bus::{Delivery, MessageBus};

use crate::RuntimeError;

/// Terminal disposition of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The event was processed to completion.
    Completed,
    /// Another worker already owns or finished this event; acked silently.
    Duplicate,
    /// The envelope could not be decoded; acked and discarded.
    Poison,
}

/// A worker entry point: `(envelope delivery, injected context) → outcome`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable handler name recorded on receipts.
    fn name(&self) -> &'static str;

    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, RuntimeError>;
}

/// Drives one topic subscription against one handler.
pub struct Runner {
    bus: Arc<dyn MessageBus>,
    topic: String,
    handler: Arc<dyn EventHandler>,
}

impl Runner {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            bus,
            topic: topic.into(),
            handler,
        }
    }

    /// Consume the subscription until the topic closes.
    pub async fn run(self) {
        loop {
            match self.bus.pull(&self.topic).await {
                Ok(Some(delivery)) => self.dispatch(delivery).await,
                Ok(None) => {
                    tracing::info!(topic = %self.topic, "subscription closed; runner exiting");
                    break;
                }
                Err(err) => {
                    tracing::error!(topic = %self.topic, error = %err, "pull failed; runner exiting");
                    break;
                }
            }
        }
    }

    /// Process a single delivery: ack by default, nack on a raised error.
    pub async fn dispatch(&self, delivery: Delivery) {
        let attempt = delivery.attempt;
        match self.handler.handle(&delivery).await {
            Ok(outcome) => {
                tracing::debug!(
                    topic = %self.topic,
                    handler = self.handler.name(),
                    attempt,
                    outcome = ?outcome,
                    "delivery acknowledged"
                );
            }
            Err(err) => {
                tracing::warn!(
                    topic = %self.topic,
                    handler = self.handler.name(),
                    attempt,
                    error = %err,
                    "handler raised; nacking for redelivery"
                );
                if let Err(nack_err) = self.bus.nack(&self.topic, delivery).await {
                    tracing::error!(
                        topic = %self.topic,
                        error = %nack_err,
                        "nack failed; delivery lost to the transport"
                    );
                }
            }
        }
    }
}
