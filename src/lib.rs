//! # Email relay
//! A RabbitMQ-backed email queue: an HTTP API enqueues emails, workers send
//! them with bounded immediate retry, and exhausted items are dead-lettered.

pub mod amqp;
pub mod api;
pub mod broker;
pub mod config;
pub mod email;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod memory;
pub mod retry;
pub mod worker;

// Re-export key components for easy access
pub use broker::{Broker, Publisher};
pub use config::RelayConfig;
pub use email::{EmailHandler, EmailMessage};
pub use engine::{ConsumptionEngine, Disposition};
pub use envelope::{DeliveryTag, InboundDelivery, WorkItem, RETRY_COUNT_HEADER};
pub use error::WorkerError;
pub use handler::{Json, MessageHandler, TaskHandler};
pub use memory::MemoryBroker;
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::Worker;
