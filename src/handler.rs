//! Defines the traits for task handling logic.

use crate::error::WorkerError;
use async_trait::async_trait;
use serde::Deserialize;

/// The capability the consumption engine needs: process an opaque payload
/// and report success or failure.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Processes one payload. Any `Err` is a task failure subject to retry.
    async fn process(&self, payload: &[u8]) -> Result<(), WorkerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// A typed handler for JSON payloads.
///
/// Implement this trait for your message type and business logic, then
/// wrap it in [`Json`] to hand it to the engine.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The type of the message that this handler can process.
    /// Must be deserializable from JSON.
    type MessageType: for<'de> Deserialize<'de> + Send + Sync;

    /// Processes a single deserialized message.
    ///
    /// # Returns
    /// `Ok(())` if the message was processed successfully, or a `WorkerError` if not.
    async fn handle_message(&self, message: Self::MessageType) -> Result<(), WorkerError>;

    fn handler_name(&self) -> &str;
}

/// Adapts a [`MessageHandler`] to the opaque [`TaskHandler`] interface.
/// A payload that fails to deserialize counts as a task failure.
pub struct Json<H>(pub H);

#[async_trait]
impl<H: MessageHandler> TaskHandler for Json<H> {
    async fn process(&self, payload: &[u8]) -> Result<(), WorkerError> {
        let message: H::MessageType = serde_json::from_slice(payload)?;
        self.0.handle_message(message).await
    }

    fn handler_name(&self) -> &str {
        self.0.handler_name()
    }
}
