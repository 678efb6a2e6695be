//! The per-delivery consumption protocol: process, then ack, re-publish, or reject.

use crate::broker::Broker;
use crate::envelope::InboundDelivery;
use crate::error::WorkerError;
use crate::handler::TaskHandler;
use crate::retry::{RetryDecision, RetryPolicy};
use futures_util::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;

/// How a single delivery was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The task succeeded and the delivery was acknowledged.
    Completed,
    /// The task failed; a copy carrying `retry_count` was published and the
    /// original delivery acknowledged.
    Retried { retry_count: u32 },
    /// The retry budget was exhausted; the delivery was rejected towards the
    /// dead-letter queue.
    DeadLettered,
}

/// Drives deliveries through the handler and finalizes each exactly once.
///
/// The engine holds no state of its own beyond its collaborators; retry
/// state travels in the messages.
pub struct ConsumptionEngine<B, H> {
    broker: Arc<B>,
    handler: Arc<H>,
    policy: RetryPolicy,
}

impl<B: Broker, H: TaskHandler> ConsumptionEngine<B, H> {
    pub fn new(broker: Arc<B>, handler: Arc<H>, policy: RetryPolicy) -> Self {
        Self { broker, handler, policy }
    }

    /// Processes deliveries one at a time until the stream ends or
    /// `shutdown` flips to `true`.
    ///
    /// Shutdown is only observed between deliveries, so a delivery that has
    /// been pulled is always acked or rejected before this returns. A
    /// failing ack, reject or re-publish is returned to the caller, leaving
    /// the delivery for the broker to redeliver.
    pub async fn consume<S>(&self, deliveries: S, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError>
    where
        S: Stream<Item = Result<InboundDelivery, WorkerError>>,
    {
        futures_util::pin_mut!(deliveries);

        loop {
            if *shutdown.borrow() {
                log::info!("Shutdown requested; no further deliveries will be pulled.");
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        log::info!("Shutdown signal dropped; stopping consumer.");
                        return Ok(());
                    }
                    continue;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(delivery) => {
                    self.handle(delivery?).await?;
                }
                None => return Err(WorkerError::ConsumerClosed),
            }
        }
    }

    /// Runs the handler for one delivery and finalizes it.
    pub async fn handle(&self, delivery: InboundDelivery) -> Result<Disposition, WorkerError> {
        let InboundDelivery { tag, item } = delivery;
        log::debug!(
            "Received delivery {} (retry count {}) for handler '{}'",
            tag.0,
            item.retry_count,
            self.handler.handler_name()
        );

        let outcome = match AssertUnwindSafe(self.handler.process(&item.payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(WorkerError::HandlerPanicked(panic_message(panic))),
        };

        let error = match outcome {
            Ok(()) => {
                self.broker.ack(tag).await?;
                log::info!("Message processed successfully. Tag: {}", tag.0);
                return Ok(Disposition::Completed);
            }
            Err(e) => e,
        };

        log::error!("Failed to process message. Tag: {}, Error: {}", tag.0, error);

        match self.policy.decide(item.retry_count) {
            RetryDecision::Retry { next_retry_count } => {
                // The copy must be durable before the original is acked.
                self.broker.publish(&item.next_attempt(next_retry_count)).await?;
                self.broker.ack(tag).await?;
                log::info!(
                    "Message republished for retry attempt {} of {} ({} left after this one).",
                    next_retry_count,
                    self.policy.max_retries,
                    self.policy.attempts_remaining(next_retry_count)
                );
                Ok(Disposition::Retried { retry_count: next_retry_count })
            }
            RetryDecision::DeadLetter => {
                self.broker.reject(tag).await?;
                log::warn!(
                    "Max retries ({}) exceeded; message rejected to the dead-letter queue. Tag: {}",
                    self.policy.max_retries,
                    tag.0
                );
                Ok(Disposition::DeadLettered)
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Publisher;
    use crate::envelope::{DeliveryTag, WorkItem};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Publish(WorkItem),
        Ack(u64),
        Reject(u64),
    }

    #[derive(Default)]
    struct RecordingBroker {
        calls: Mutex<Vec<Call>>,
        fail_publish: bool,
    }

    impl RecordingBroker {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Publisher for RecordingBroker {
        async fn publish(&self, item: &WorkItem) -> Result<(), WorkerError> {
            if self.fail_publish {
                return Err(WorkerError::Unavailable("connection reset".to_string()));
            }
            self.calls.lock().unwrap().push(Call::Publish(item.clone()));
            Ok(())
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn ack(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
            self.calls.lock().unwrap().push(Call::Ack(tag.0));
            Ok(())
        }

        async fn reject(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
            self.calls.lock().unwrap().push(Call::Reject(tag.0));
            Ok(())
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct StubHandler(Behaviour);

    #[async_trait]
    impl TaskHandler for StubHandler {
        async fn process(&self, _payload: &[u8]) -> Result<(), WorkerError> {
            match self.0 {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err("smtp timeout".into()),
                Behaviour::Panic => panic!("handler blew up"),
            }
        }

        fn handler_name(&self) -> &str {
            "stub"
        }
    }

    fn engine(broker: &Arc<RecordingBroker>, behaviour: Behaviour, max_retries: u32) -> ConsumptionEngine<RecordingBroker, StubHandler> {
        ConsumptionEngine::new(
            broker.clone(),
            Arc::new(StubHandler(behaviour)),
            RetryPolicy::new(max_retries),
        )
    }

    fn delivery(tag: u64, retry_count: u32) -> InboundDelivery {
        InboundDelivery {
            tag: DeliveryTag(tag),
            item: WorkItem::new(br#"{"to":"a@example.com"}"#.to_vec()).next_attempt(retry_count),
        }
    }

    #[tokio::test]
    async fn success_is_acked_without_publish() {
        let broker = Arc::new(RecordingBroker::default());

        let disposition = engine(&broker, Behaviour::Succeed, 3).handle(delivery(7, 0)).await.unwrap();

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(broker.calls(), vec![Call::Ack(7)]);
    }

    #[tokio::test]
    async fn failure_publishes_incremented_copy_then_acks() {
        let broker = Arc::new(RecordingBroker::default());

        let disposition = engine(&broker, Behaviour::Fail, 3).handle(delivery(7, 1)).await.unwrap();

        assert_eq!(disposition, Disposition::Retried { retry_count: 2 });
        assert_eq!(
            broker.calls(),
            vec![Call::Publish(delivery(0, 2).item), Call::Ack(7)]
        );
    }

    #[tokio::test]
    async fn retried_copy_keeps_delivered_properties() {
        use lapin::{types::{AMQPValue, FieldTable}, BasicProperties};

        let broker = Arc::new(RecordingBroker::default());
        let mut headers = FieldTable::default();
        headers.insert("x-tenant".into(), AMQPValue::LongString("acme".into()));
        let delivered = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_headers(headers);
        let inbound = InboundDelivery {
            tag: DeliveryTag(5),
            item: WorkItem::from_amqp(b"{}".to_vec(), delivered.clone()),
        };

        engine(&broker, Behaviour::Fail, 3).handle(inbound).await.unwrap();

        let calls = broker.calls();
        let Call::Publish(copy) = &calls[0] else {
            panic!("expected a publish first, got {calls:?}");
        };
        assert_eq!(copy.properties, delivered);
        let published = copy.publish_properties();
        assert_eq!(
            published.headers().as_ref().and_then(|h| h.inner().get("x-tenant")),
            Some(&AMQPValue::LongString("acme".into()))
        );
        assert_eq!(crate::envelope::retry_count_from_properties(&published), 1);
        assert_eq!(calls[1], Call::Ack(5));
    }

    #[tokio::test]
    async fn exhausted_failure_is_rejected_without_publish() {
        let broker = Arc::new(RecordingBroker::default());

        let disposition = engine(&broker, Behaviour::Fail, 3).handle(delivery(7, 3)).await.unwrap();

        assert_eq!(disposition, Disposition::DeadLettered);
        assert_eq!(broker.calls(), vec![Call::Reject(7)]);
    }

    #[tokio::test]
    async fn zero_retries_dead_letters_first_failure() {
        let broker = Arc::new(RecordingBroker::default());

        let disposition = engine(&broker, Behaviour::Fail, 0).handle(delivery(1, 0)).await.unwrap();

        assert_eq!(disposition, Disposition::DeadLettered);
        assert_eq!(broker.calls(), vec![Call::Reject(1)]);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let broker = Arc::new(RecordingBroker::default());

        let disposition = engine(&broker, Behaviour::Panic, 3).handle(delivery(9, 0)).await.unwrap();

        assert_eq!(disposition, Disposition::Retried { retry_count: 1 });
        assert_eq!(broker.calls(), vec![Call::Publish(delivery(0, 1).item), Call::Ack(9)]);
    }

    #[tokio::test]
    async fn failed_republish_leaves_delivery_unacked() {
        let broker = Arc::new(RecordingBroker {
            fail_publish: true,
            ..Default::default()
        });

        let result = engine(&broker, Behaviour::Fail, 3).handle(delivery(4, 0)).await;

        assert!(matches!(result, Err(WorkerError::Unavailable(_))));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn consume_reports_closed_stream() {
        let broker = Arc::new(RecordingBroker::default());
        let (_tx, rx) = watch::channel(false);
        let deliveries = futures_util::stream::iter(vec![Ok(delivery(1, 0)), Ok(delivery(2, 0))]);

        let result = engine(&broker, Behaviour::Succeed, 3).consume(deliveries, rx).await;

        assert!(matches!(result, Err(WorkerError::ConsumerClosed)));
        assert_eq!(broker.calls(), vec![Call::Ack(1), Call::Ack(2)]);
    }

    #[tokio::test]
    async fn consume_stops_before_pulling_when_shut_down() {
        let broker = Arc::new(RecordingBroker::default());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let deliveries = futures_util::stream::iter(vec![Ok(delivery(1, 0))]);

        engine(&broker, Behaviour::Succeed, 3).consume(deliveries, rx).await.unwrap();

        assert!(broker.calls().is_empty());
    }
}
