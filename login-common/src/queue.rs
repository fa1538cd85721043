//! # Queue
//!
//! A `MessageSource` is any queue with at-least-once delivery, visibility timeouts and per-message
//! deletion: SQS in production (see `sqs::SqsSource`) and `memory::MemoryQueue` in tests.
//!
//! `QueueConsumer` wraps a source with the retry and timeout handling every caller needs.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::retry::RetryPolicy;

/// The most messages a source will hand out in a single receive call.
pub const MAX_BATCH_SIZE: usize = 10;

/// A message claimed from a source. Other consumers can't see it until its lease expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Assigned by the source when the message was sent, the same across redeliveries.
    pub message_id: String,
    /// Proof of this particular delivery, required to acknowledge it.
    pub token: String,
    pub body: Vec<u8>,
    /// Approximate number of times this message has been delivered, including this time.
    pub receive_count: u32,
}

/// Enumeration of errors a source can return when receiving messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source could not be reached: {0}")]
    Transient(String),
    #[error("source rejected the request: {0}")]
    Fatal(String),
}

/// Enumeration of errors when acknowledging a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("receipt token expired or was already acknowledged")]
    TokenExpired,
    #[error("source could not be reached to acknowledge: {0}")]
    Unavailable(String),
}

/// Enumeration of errors surfaced by `QueueConsumer` to its caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("source unavailable after {attempts} attempts: {reason}")]
    SourceUnavailable { attempts: u32, reason: String },
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Claim up to `max_messages`, waiting up to `wait_time` for at least one to arrive.
    /// Returns an empty `Vec` if none did.
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: time::Duration,
    ) -> Result<Vec<QueueMessage>, SourceError>;

    /// Remove a claimed message from the source for good.
    async fn delete(&self, token: &str) -> Result<(), AckError>;
}

/// Retrieves batches of messages from a `MessageSource` and acknowledges them one by one.
#[derive(Clone)]
pub struct QueueConsumer {
    source: Arc<dyn MessageSource>,
    /// How long a poll waits for messages to arrive.
    wait_time: time::Duration,
    /// Upper bound for any single call to the source, on top of `wait_time` for polls.
    call_timeout: time::Duration,
    retry_policy: RetryPolicy,
}

impl QueueConsumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        wait_time: time::Duration,
        call_timeout: time::Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            wait_time,
            call_timeout,
            retry_policy,
        }
    }

    /// Claim a batch of messages. `max_messages` is clamped between 1 and `MAX_BATCH_SIZE`.
    ///
    /// Transient failures are retried according to our `RetryPolicy`. If they keep failing we give
    /// up with `ConsumerError::SourceUnavailable`: no messages were claimed in that case.
    pub async fn poll(&self, max_messages: usize) -> Result<Vec<QueueMessage>, ConsumerError> {
        let max_messages = max_messages.clamp(1, MAX_BATCH_SIZE);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::time::timeout(
                self.wait_time + self.call_timeout,
                self.source.receive(max_messages, self.wait_time),
            )
            .await
            .unwrap_or_else(|_| Err(SourceError::Transient("receive timed out".to_owned())));

            match result {
                Ok(messages) => return Ok(messages),
                Err(SourceError::Fatal(reason)) => {
                    return Err(ConsumerError::SourceUnavailable {
                        attempts: attempt,
                        reason,
                    })
                }
                Err(SourceError::Transient(reason)) => {
                    if !self.retry_policy.should_retry(attempt) {
                        return Err(ConsumerError::SourceUnavailable {
                            attempts: attempt,
                            reason,
                        });
                    }

                    let interval = self.retry_policy.retry_interval(attempt);
                    warn!(attempt, ?interval, error = %reason, "failed to poll source, retrying");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    /// Acknowledge a message so it is never delivered again.
    ///
    /// An expired or already used token is reported as `AckError::TokenExpired` straight away,
    /// retrying can't fix it.
    pub async fn acknowledge(&self, token: &str) -> Result<(), AckError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::time::timeout(self.call_timeout, self.source.delete(token))
                .await
                .unwrap_or_else(|_| Err(AckError::Unavailable("delete timed out".to_owned())));

            match result {
                Ok(()) => return Ok(()),
                Err(AckError::TokenExpired) => return Err(AckError::TokenExpired),
                Err(AckError::Unavailable(reason)) => {
                    if !self.retry_policy.should_retry(attempt) {
                        return Err(AckError::Unavailable(reason));
                    }

                    let interval = self.retry_policy.retry_interval(attempt);
                    warn!(
                        attempt,
                        ?interval,
                        error = %reason,
                        "failed to acknowledge message, retrying"
                    );
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}
