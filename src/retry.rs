//! Retry policy for failed deliveries.

use serde::{Deserialize, Serialize};

/// Default number of re-publishes before an item is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What to do with a delivery whose task just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-publish the item carrying `next_retry_count` in its metadata.
    Retry { next_retry_count: u32 },
    /// Reject the delivery so the broker routes it to the dead-letter queue.
    DeadLetter,
}

/// Bounded retry policy. Re-publishing is immediate; there is no delay
/// between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries allowed after the first attempt. `0` dead-letters
    /// on the first failure.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decides the fate of a failed item given the retry count it was
    /// delivered with.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if self.should_retry(retry_count) {
            RetryDecision::Retry {
                next_retry_count: retry_count.saturating_add(1),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Checks if a message should be retried based on the current `retry_count`.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Retries left for an item delivered with `retry_count`.
    pub fn attempts_remaining(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}
