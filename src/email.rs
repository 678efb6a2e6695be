//! The email domain: the queued message, address validation and the
//! delivery handler.

use crate::error::WorkerError;
use crate::handler::MessageHandler;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Longest address accepted (RFC 5321 path limit minus the angle brackets).
const MAX_ADDRESS_LEN: usize = 254;

/// An email waiting to be sent; the payload of every work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl EmailMessage {
    pub fn validate(&self) -> Result<(), String> {
        if is_valid_address(&self.to) {
            Ok(())
        } else {
            Err(format!("'{}' is not a valid email address", self.to))
        }
    }
}

/// Structural address check: one `@`, a non-empty local part and a dotted
/// domain without empty labels. No whitespace anywhere.
pub fn is_valid_address(address: &str) -> bool {
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN || address.chars().any(char::is_whitespace) {
        return false;
    }

    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };

    if local.is_empty() || domain.contains('@') {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_alphanumeric() || c == '-')
        })
}

/// Sends emails. Delivery is simulated: each attempt fails with
/// probability `failure_rate`.
pub struct EmailHandler {
    failure_rate: f64,
}

impl EmailHandler {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl MessageHandler for EmailHandler {
    type MessageType = EmailMessage;

    async fn handle_message(&self, message: EmailMessage) -> Result<(), WorkerError> {
        log::info!("Sending email to {} (subject: {:?})", message.to, message.subject);

        if rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(format!("Simulated email failure for {}", message.to).into());
        }

        log::info!("Email sent successfully to {}", message.to);
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "email"
    }
}
