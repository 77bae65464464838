//! In-process topic bus.
//!
//! Backs the `MessageBus` abstraction for development, tests and single-node
//! deployments. Delivery is at-least-once from the consumer's perspective:
//! a nacked delivery is re-enqueued with an incremented attempt counter
//! until attempts are exhausted, then routed to the topic's dead-letter
//! companion. Nothing consumes dead letters automatically.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use relay_core::bus::{
    BusError, Delivery, Envelope, MessageBus, PublishedMessage, MAX_DELIVERY_ATTEMPTS,
    TOPIC_ACTION, TOPIC_ACTION_DEAD_LETTER, TOPIC_REASONING, TOPIC_REASONING_DEAD_LETTER,
};

struct Topic {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    dead_letter: Option<String>,
}

impl Topic {
    fn new(dead_letter: Option<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            dead_letter,
        }
    }
}

/// In-process implementation of the topic bus.
pub struct InProcessBus {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    max_attempts: u32,
}

impl InProcessBus {
    /// Create an empty bus with the given per-subscription attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create a bus pre-registered with the standard pipeline topics and
    /// their dead-letter companions.
    pub fn with_default_topics() -> Self {
        let bus = Self::new(MAX_DELIVERY_ATTEMPTS);
        bus.register_topic(TOPIC_REASONING, Some(TOPIC_REASONING_DEAD_LETTER));
        bus.register_topic(TOPIC_ACTION, Some(TOPIC_ACTION_DEAD_LETTER));
        bus
    }

    /// Register a topic, creating its dead-letter companion when named.
    pub fn register_topic(&self, name: &str, dead_letter: Option<&str>) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        if let Some(dead_letter) = dead_letter {
            topics
                .entry(dead_letter.to_string())
                .or_insert_with(|| Arc::new(Topic::new(None)));
        }
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(dead_letter.map(str::to_string))));
    }

    /// The configured attempt budget.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>, BusError> {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        topics
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::UnknownTopic(name.to_string()))
    }

    /// Pull without waiting; `None` when the topic is empty. Used by tests
    /// and dead-letter inspection.
    pub async fn try_pull(&self, topic: &str) -> Result<Option<Delivery>, BusError> {
        let topic = self.topic(topic)?;
        let mut rx = topic.rx.lock().await;
        Ok(rx.try_recv().ok())
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        let target = self.topic(topic)?;
        let message = PublishedMessage {
            data: envelope.encode()?,
            attributes: envelope.attributes(),
        };
        target
            .tx
            .send(Delivery {
                message,
                attempt: 1,
            })
            .map_err(|e| BusError::Publish(e.to_string()))?;
        tracing::debug!(
            topic = %topic,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "envelope published"
        );
        Ok(())
    }

    async fn pull(&self, topic: &str) -> Result<Option<Delivery>, BusError> {
        let topic = self.topic(topic)?;
        let mut rx = topic.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn nack(&self, topic: &str, delivery: Delivery) -> Result<(), BusError> {
        let source = self.topic(topic)?;
        if delivery.attempt >= self.max_attempts {
            let Some(dead_letter) = source.dead_letter.clone() else {
                tracing::error!(
                    topic = %topic,
                    attempt = delivery.attempt,
                    "delivery attempts exhausted and no dead-letter topic; dropping"
                );
                return Ok(());
            };
            tracing::warn!(
                topic = %topic,
                dead_letter = %dead_letter,
                attempt = delivery.attempt,
                "delivery attempts exhausted; routing to dead letter"
            );
            let target = self.topic(&dead_letter)?;
            target
                .tx
                .send(delivery)
                .map_err(|e| BusError::Publish(e.to_string()))?;
            return Ok(());
        }

        let redelivery = Delivery {
            message: delivery.message,
            attempt: delivery.attempt + 1,
        };
        source
            .tx
            .send(redelivery)
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn drain_dead_letters(&self, topic: &str) -> Result<Vec<Delivery>, BusError> {
        let source = self.topic(topic)?;
        let dead_letter = source
            .dead_letter
            .clone()
            .ok_or_else(|| BusError::UnknownTopic(format!("{} has no dead letter", topic)))?;
        let mut drained = Vec::new();
        while let Some(delivery) = self.try_pull(&dead_letter).await? {
            drained.push(delivery);
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::bus::{EventType, Producer};
    use serde_json::Map;

    fn envelope() -> Envelope {
        Envelope::new(
            EventType::ReasoningRequested,
            "conv-1",
            "msg-1",
            Producer::Api,
            Map::new(),
        )
    }

    #[test]
    fn test_publish_and_pull_round_trip() {
        tokio_test::block_on(async {
            let bus = InProcessBus::with_default_topics();
            let sent = envelope();
            bus.publish(TOPIC_REASONING, &sent).await.expect("publish");

            let delivery = bus
                .pull(TOPIC_REASONING)
                .await
                .expect("pull")
                .expect("delivery");
            assert_eq!(delivery.attempt, 1);
            assert_eq!(delivery.message.attributes["eventId"], sent.event_id);

            let decoded = delivery.envelope().expect("decode");
            assert_eq!(decoded.event_id, sent.event_id);
        });
    }

    #[test]
    fn test_publish_to_unknown_topic_fails() {
        tokio_test::block_on(async {
            let bus = InProcessBus::with_default_topics();
            assert!(matches!(
                bus.publish("no-such-topic", &envelope()).await,
                Err(BusError::UnknownTopic(_))
            ));
        });
    }

    #[test]
    fn test_nack_redelivers_with_incremented_attempt() {
        tokio_test::block_on(async {
            let bus = InProcessBus::with_default_topics();
            bus.publish(TOPIC_REASONING, &envelope())
                .await
                .expect("publish");

            let first = bus
                .pull(TOPIC_REASONING)
                .await
                .expect("pull")
                .expect("delivery");
            bus.nack(TOPIC_REASONING, first).await.expect("nack");

            let second = bus
                .pull(TOPIC_REASONING)
                .await
                .expect("pull")
                .expect("redelivery");
            assert_eq!(second.attempt, 2);
        });
    }

    #[test]
    fn test_exhausted_delivery_routes_to_dead_letter() {
        tokio_test::block_on(async {
            let bus = InProcessBus::with_default_topics();
            let sent = envelope();
            bus.publish(TOPIC_REASONING, &sent).await.expect("publish");

            for _ in 0..MAX_DELIVERY_ATTEMPTS {
                let delivery = bus
                    .pull(TOPIC_REASONING)
                    .await
                    .expect("pull")
                    .expect("delivery");
                bus.nack(TOPIC_REASONING, delivery).await.expect("nack");
            }

            // The main topic is dry; the envelope sits in the dead letter.
            assert!(bus
                .try_pull(TOPIC_REASONING)
                .await
                .expect("try_pull")
                .is_none());
            let dead = bus
                .drain_dead_letters(TOPIC_REASONING)
                .await
                .expect("drain");
            assert_eq!(dead.len(), 1);
            assert_eq!(dead[0].attempt, MAX_DELIVERY_ATTEMPTS);
            assert_eq!(dead[0].message.attributes["eventId"], sent.event_id);
        });
    }
}
