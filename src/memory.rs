//! In-process delivery substrate.
//!
//! Mirrors the broker contract the engine relies on: a main queue, a set
//! of unacknowledged deliveries, and a dead-letter queue fed by rejects.
//! Each delivery instance is handed to exactly one consumer.

use crate::broker::{Broker, Publisher};
use crate::envelope::{DeliveryTag, InboundDelivery, WorkItem};
use crate::error::WorkerError;
use async_trait::async_trait;
use futures_util::{stream, Stream};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<WorkItem>,
    unacked: HashMap<DeliveryTag, WorkItem>,
    dead_letters: Vec<WorkItem>,
    next_tag: u64,
    published: usize,
    delivered: usize,
    acked: usize,
    rejected: usize,
    unavailable: bool,
}

/// Counters describing everything the broker has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: usize,
    pub delivered: usize,
    pub acked: usize,
    pub rejected: usize,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    ready: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent publishes fail as if the broker were unreachable.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Hands out the next ready item, if any, under a fresh delivery tag.
    pub fn try_receive(&self) -> Option<InboundDelivery> {
        let mut state = self.lock();
        let item = state.ready.pop_front()?;
        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        state.unacked.insert(tag, item.clone());
        state.delivered += 1;
        Some(InboundDelivery { tag, item })
    }

    /// Waits until an item is ready and delivers it.
    pub async fn receive(&self) -> InboundDelivery {
        loop {
            if let Some(delivery) = self.try_receive() {
                return delivery;
            }
            self.ready.notified().await;
        }
    }

    /// An endless stream of deliveries for [`crate::ConsumptionEngine::consume`].
    pub fn deliveries(self: &Arc<Self>) -> impl Stream<Item = Result<InboundDelivery, WorkerError>> + Send + 'static {
        stream::unfold(self.clone(), |broker| async move {
            let delivery = broker.receive().await;
            Some((Ok(delivery), broker))
        })
    }

    /// Number of items waiting in the main queue.
    pub fn queue_depth(&self) -> usize {
        self.lock().ready.len()
    }

    /// Deliveries handed out but neither acked nor rejected.
    pub fn in_flight(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn dead_letters(&self) -> Vec<WorkItem> {
        self.lock().dead_letters.clone()
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.lock();
        BrokerStats {
            published: state.published,
            delivered: state.delivered,
            acked: state.acked,
            rejected: state.rejected,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, item: &WorkItem) -> Result<(), WorkerError> {
        {
            let mut state = self.lock();
            if state.unavailable {
                return Err(WorkerError::Unavailable("in-memory broker is offline".to_string()));
            }
            state.ready.push_back(item.clone());
            state.published += 1;
        }
        self.ready.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
        let mut state = self.lock();
        state.unacked.remove(&tag).ok_or(WorkerError::UnknownDelivery(tag.0))?;
        state.acked += 1;
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
        let mut state = self.lock();
        let item = state.unacked.remove(&tag).ok_or(WorkerError::UnknownDelivery(tag.0))?;
        // Dead-letter routing keeps the message exactly as it was delivered.
        state.dead_letters.push(item);
        state.rejected += 1;
        Ok(())
    }
}
