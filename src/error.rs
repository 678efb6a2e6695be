use thiserror::Error;

/// Error type shared by the worker, the broker adapters and the ingestion API.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Error while encoding or decoding a JSON payload.
    #[error("Failed to (de)serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or unparseable configuration value.
    #[error("Configuration error: {message}")]
    Config {
        message: String,
    },

    /// A task handler reported that it could not process the payload.
    #[error("Task failed: {message}")]
    Task {
        message: String,
    },

    /// The task handler panicked while processing a payload.
    #[error("Message handler panicked: {0}")]
    HandlerPanicked(String),

    /// The broker refused a publish (negative publisher confirm).
    #[error("Publish to exchange '{exchange}' with key '{routing_key}' was not confirmed by the broker")]
    PublishNacked {
        exchange: String,
        routing_key: String,
    },

    /// Ack or reject addressed a delivery tag that is not in flight.
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(u64),

    /// The broker cannot be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The consumer stream ended, usually because the channel was closed.
    #[error("Consumer stream closed by the broker")]
    ConsumerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        WorkerError::Config { message: message.into() }
    }
}

// Handlers signal failure with plain strings.
impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::Task { message: s.to_string() }
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::Task { message: s }
    }
}
