//! RabbitMQ implementation of the delivery substrate, built on `lapin`.

use crate::broker::{Broker, Publisher};
use crate::config::RelayConfig;
use crate::envelope::{DeliveryTag, InboundDelivery, WorkItem};
use crate::error::WorkerError;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Opens a connection and a channel with publisher confirms enabled.
pub async fn connect(config: &RelayConfig) -> Result<(Connection, Channel), WorkerError> {
    let connection = Connection::connect_uri(config.amqp_uri(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel.confirm_select(ConfirmSelectOptions::default()).await?;
    Ok((connection, channel))
}

/// Declares the main exchange. Safe to call repeatedly.
pub async fn declare_exchange(channel: &Channel, config: &RelayConfig) -> Result<(), WorkerError> {
    channel
        .exchange_declare(
            &config.exchange_name,
            ExchangeKind::Direct,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// Declares both exchanges and queues and binds them.
///
/// The main queue dead-letters into the DLX under the main routing key,
/// which is what makes a reject without requeue land in the DLQ.
pub async fn declare_topology(channel: &Channel, config: &RelayConfig) -> Result<(), WorkerError> {
    declare_exchange(channel, config).await?;

    channel
        .exchange_declare(
            &config.dead_letter_exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            &config.queue_name,
            QueueDeclareOptions { durable: true, ..Default::default() },
            dead_letter_arguments(config),
        )
        .await?;

    channel
        .queue_bind(
            &config.queue_name,
            &config.exchange_name,
            &config.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            &config.dead_letter_queue,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            &config.dead_letter_queue,
            &config.dead_letter_exchange,
            &config.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    log::info!(
        "Queue '{}' bound to '{}' with dead-lettering into '{}' via '{}'.",
        config.queue_name,
        config.exchange_name,
        config.dead_letter_queue,
        config.dead_letter_exchange
    );
    Ok(())
}

fn dead_letter_arguments(config: &RelayConfig) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(config.dead_letter_exchange.clone().into()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(config.routing_key.clone().into()),
    );
    arguments
}

/// Sets QoS and starts consuming the main queue.
pub async fn consume(
    channel: &Channel,
    config: &RelayConfig,
) -> Result<impl Stream<Item = Result<InboundDelivery, WorkerError>>, WorkerError> {
    channel.basic_qos(config.prefetch_count, BasicQosOptions::default()).await?;
    log::info!("QoS prefetch count set to {}", config.prefetch_count);

    let consumer = channel
        .basic_consume(
            &config.queue_name,
            &config.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    log::info!(
        "Consumer started with tag '{}'. Waiting for messages...",
        consumer.tag().as_str()
    );

    Ok(consumer.map(|delivery| delivery.map(InboundDelivery::from).map_err(WorkerError::from)))
}

async fn publish_confirmed(channel: &Channel, config: &RelayConfig, item: &WorkItem) -> Result<(), WorkerError> {
    let confirmation = channel
        .basic_publish(
            &config.exchange_name,
            &config.routing_key,
            BasicPublishOptions::default(),
            &item.payload,
            item.publish_properties(),
        )
        .await?
        .await?;

    if confirmation.is_nack() {
        return Err(WorkerError::PublishNacked {
            exchange: config.exchange_name.clone(),
            routing_key: config.routing_key.clone(),
        });
    }
    Ok(())
}

/// Worker-side substrate bound to one channel.
pub struct AmqpBroker {
    channel: Channel,
    config: RelayConfig,
}

impl AmqpBroker {
    /// `channel` must have publisher confirms enabled (see [`connect`]).
    pub fn new(channel: Channel, config: RelayConfig) -> Self {
        Self { channel, config }
    }
}

#[async_trait]
impl Publisher for AmqpBroker {
    async fn publish(&self, item: &WorkItem) -> Result<(), WorkerError> {
        publish_confirmed(&self.channel, &self.config, item).await
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
        self.channel.basic_ack(tag.0, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
        self.channel
            .basic_reject(tag.0, BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}

/// A lazily created shared value, replaced after failures.
///
/// The lock only guards reading or swapping the slot; connecting and using
/// the value happen outside it, so concurrent callers never queue behind
/// each other's I/O.
pub(crate) struct SessionSlot<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> SessionSlot<T> {
    pub(crate) fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    pub(crate) fn current(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    /// Stores `fresh` unless another caller got there first, and returns
    /// whichever value is now current.
    pub(crate) fn install(&self, fresh: Arc<T>) -> Arc<T> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                *slot = Some(fresh.clone());
                fresh
            }
        }
    }

    /// Clears the slot if it still holds `stale`. A value installed since
    /// `stale` was handed out is left alone.
    pub(crate) fn invalidate(&self, stale: &Arc<T>) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *slot = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Session {
    connection: Connection,
    channel: Channel,
}

/// Publisher for the ingestion API.
///
/// Opens its connection on first use and shares it between requests. Any
/// failure drops the cached session so the next publish reconnects.
pub struct AmqpPublisher {
    config: RelayConfig,
    session: SessionSlot<Session>,
}

impl AmqpPublisher {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            session: SessionSlot::new(),
        }
    }

    async fn session(&self) -> Result<Arc<Session>, WorkerError> {
        if let Some(session) = self.session.current() {
            return Ok(session);
        }

        let (connection, channel) = connect(&self.config).await?;
        declare_exchange(&channel, &self.config).await?;
        let fresh = Arc::new(Session { connection, channel });

        let current = self.session.install(fresh.clone());
        if !Arc::ptr_eq(&current, &fresh) {
            // Lost the race to a concurrent request.
            if let Err(e) = fresh.connection.close(200, "duplicate session").await {
                log::debug!("Closing duplicate connection failed: {}", e);
            }
        }
        Ok(current)
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, item: &WorkItem) -> Result<(), WorkerError> {
        let session = self.session().await?;

        let result = publish_confirmed(&session.channel, &self.config, item).await;
        if let Err(e) = &result {
            log::warn!("Publish failed, dropping broker session: {}", e);
            self.session.invalidate(&session);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_queue_dead_letters_into_dlx() {
        let config = RelayConfig::builder()
            .dead_letter_exchange("dlx.test".to_string())
            .routing_key("test.send".to_string())
            .build();

        let arguments = dead_letter_arguments(&config);
        let inner = arguments.inner();

        assert_eq!(
            inner.get("x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("dlx.test".into()))
        );
        assert_eq!(
            inner.get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("test.send".into()))
        );
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_publish_error() {
        let config = RelayConfig::builder()
            .rabbitmq_host("127.0.0.1".to_string())
            .rabbitmq_port(1)
            .build();
        let publisher = AmqpPublisher::new(config);

        let result = publisher.publish(&WorkItem::new(b"{}".to_vec())).await;

        assert!(result.is_err());
        assert!(publisher.session.current().is_none());
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_serialize() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let slot: SessionSlot<u32> = SessionSlot::new();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        // Same shape as `AmqpPublisher::publish`: connect if empty, then use.
        let request = |id: u32| {
            let (slot, active, peak) = (&slot, &active, &peak);
            async move {
                let session = match slot.current() {
                    Some(session) => session,
                    None => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        slot.install(Arc::new(id))
                    }
                };
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                session
            }
        };

        let (first, second) = tokio::join!(request(1), request(2));

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        // Both raced to connect; the first install wins for everyone.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, 1);
    }

    #[test]
    fn invalidate_only_clears_the_failed_session() {
        let slot: SessionSlot<&str> = SessionSlot::new();
        let old = slot.install(Arc::new("old"));
        slot.invalidate(&old);
        assert!(slot.current().is_none());

        let new = slot.install(Arc::new("new"));
        slot.invalidate(&old);
        assert!(Arc::ptr_eq(&slot.current().unwrap(), &new));
    }
}
