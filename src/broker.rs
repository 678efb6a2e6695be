//! Capabilities the engine and the API require from the delivery substrate.

use crate::envelope::{DeliveryTag, WorkItem};
use crate::error::WorkerError;
use async_trait::async_trait;

/// Publishes work items to the main exchange.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `item` persistently with its retry metadata. Resolves only
    /// once the broker has accepted the message.
    async fn publish(&self, item: &WorkItem) -> Result<(), WorkerError>;
}

/// Per-delivery dispositions on top of publishing.
///
/// The main queue must be bound to a dead-letter exchange so that
/// [`Broker::reject`] routes the delivery to the dead-letter queue.
#[async_trait]
pub trait Broker: Publisher {
    /// Removes the delivery from the main queue.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), WorkerError>;

    /// Rejects the delivery without requeue.
    async fn reject(&self, tag: DeliveryTag) -> Result<(), WorkerError>;
}
