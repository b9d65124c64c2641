use async_trait::async_trait;
use dashmap::DashMap;
use db::events::EventEnvelope;
use thiserror::Error;
use tokio::sync::broadcast;

pub const BUS_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Publish seam between the outbox pipeline and whatever broker backs the
/// deployment. `partition_key` carries the aggregate id so a partitioned
/// broker keeps one invitation's events in order; brokers without
/// partitions may ignore it.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), BusError>;
}

/// Broadcast-channel bus for single-process deployments and tests. One
/// channel per topic, so ordering within a topic follows publish order.
/// Publishing with no subscribers succeeds: a broker would retain the
/// message for later consumers, and failing here would poison the outbox
/// retry budget for nothing.
#[derive(Default)]
pub struct InProcessMessageBus {
    topics: DashMap<String, broadcast::Sender<EventEnvelope>>,
}

impl InProcessMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<EventEnvelope> {
        self.sender(topic).subscribe()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<EventEnvelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for InProcessMessageBus {
    async fn publish(
        &self,
        topic: &str,
        _partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), BusError> {
        // send() errors only when no receiver exists, which is not a
        // failure for a bus.
        let _ = self.sender(topic).send(envelope.clone());
        Ok(())
    }
}
