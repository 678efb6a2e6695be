//! The email worker process: connect, declare, consume, reconnect.

use crate::amqp::{self, AmqpBroker};
use crate::config::RelayConfig;
use crate::engine::ConsumptionEngine;
use crate::error::WorkerError;
use crate::handler::TaskHandler;
use std::sync::Arc;
use tokio::sync::watch;

/// A supervised RabbitMQ worker.
///
/// Every connection gets a fresh [`ConsumptionEngine`]; nothing is carried
/// over between reconnects since all retry state lives in the queue.
pub struct Worker<H: TaskHandler> {
    handler: Arc<H>,
    config: RelayConfig,
}

impl<H: TaskHandler + 'static> Worker<H> {
    pub fn new(handler: Arc<H>, config: RelayConfig) -> Self {
        Self { handler, config }
    }

    /// Runs until `shutdown` flips to `true`, reconnecting after
    /// `reconnect_delay` whenever the broker connection fails.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.run_once(shutdown.clone()).await {
                Ok(()) => {
                    log::info!("Worker stopped.");
                    return;
                }
                Err(e) => {
                    log::error!(
                        "Worker failed: {}. Reconnecting in {:?}...",
                        e,
                        self.config.reconnect_delay
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    log::info!("Shutdown requested while reconnecting.");
                    return;
                }
            }
        }
    }

    /// One connection lifetime: set up the topology and consume until the
    /// stream ends, an error occurs or shutdown is requested.
    pub async fn run_once(&self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        log::info!(
            "Connecting to RabbitMQ at {}:{} for queue '{}'...",
            self.config.rabbitmq_host,
            self.config.rabbitmq_port,
            self.config.queue_name
        );

        let (connection, channel) = amqp::connect(&self.config).await?;
        amqp::declare_topology(&channel, &self.config).await?;
        let deliveries = amqp::consume(&channel, &self.config).await?;

        let engine = ConsumptionEngine::new(
            Arc::new(AmqpBroker::new(channel, self.config.clone())),
            self.handler.clone(),
            self.config.retry_policy,
        );
        log::info!(
            "Handler '{}' consuming with max retries {}.",
            self.handler.handler_name(),
            self.config.retry_policy.max_retries
        );

        let result = engine.consume(deliveries, shutdown).await;

        if let Err(e) = connection.close(200, "worker stopping").await {
            log::debug!("Closing connection failed: {}", e);
        }
        result
    }
}
