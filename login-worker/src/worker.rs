use std::sync::Arc;
use std::time;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use login_common::dead_letter::{DeadLetter, DeadLetterSink};
use login_common::health::HealthHandle;
use login_common::login::normalize;
use login_common::queue::{AckError, ConsumerError, QueueConsumer, QueueMessage};
use login_common::store::{PersistenceWriter, WriteOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Written to the store for the first time.
    Persisted,
    /// An earlier delivery already wrote it.
    Duplicate,
    /// Given up on and stored as a dead letter.
    DeadLettered,
    /// Left on the queue to be delivered again.
    Redelivery,
}

/// Whether the message was removed from the queue after being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Acknowledged,
    /// The acknowledgment failed: the message will be delivered again, which is harmless.
    Failed,
    NotAttempted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageReport {
    pub outcome: MessageOutcome,
    pub ack: AckStatus,
}

/// Counts of what happened to the messages of one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub persisted: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    pub redelivery: usize,
    pub acknowledged: usize,
    pub ack_failures: usize,
}

impl BatchSummary {
    fn record(&mut self, report: MessageReport) {
        self.received += 1;

        match report.outcome {
            MessageOutcome::Persisted => self.persisted += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::DeadLettered => self.dead_lettered += 1,
            MessageOutcome::Redelivery => self.redelivery += 1,
        }

        match report.ack {
            AckStatus::Acknowledged => self.acknowledged += 1,
            AckStatus::Failed => self.ack_failures += 1,
            AckStatus::NotAttempted => {}
        }
    }
}

/// Limits and timings of a `LoginWorker`.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    /// Messages requested per poll.
    pub batch_size: usize,
    /// Messages of a batch processed at the same time.
    pub max_concurrent_messages: usize,
    /// Deliveries after which a message that can't be written is dead-lettered.
    pub max_receive_count: u32,
    /// Upper bound for storing a dead letter.
    pub dead_letter_timeout: time::Duration,
    /// Pause after a poll failed, before polling again.
    pub poll_backoff: time::Duration,
}

/// A worker that moves login events from a queue to the login store.
///
/// Every message goes through `normalize`, then `PersistenceWriter::write`, and is acknowledged
/// only once it is either persisted or dead-lettered. Anything else leaves it on the queue.
pub struct LoginWorker {
    /// An identifier for this worker, used in logs.
    name: String,
    consumer: QueueConsumer,
    writer: PersistenceWriter,
    dead_letters: Arc<dyn DeadLetterSink>,
    limits: WorkerLimits,
    /// The liveness check handle, reported after every successful poll.
    liveness: HealthHandle,
}

impl LoginWorker {
    pub fn new(
        name: &str,
        consumer: QueueConsumer,
        writer: PersistenceWriter,
        dead_letters: Arc<dyn DeadLetterSink>,
        limits: WorkerLimits,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            consumer,
            writer,
            dead_letters,
            limits: WorkerLimits {
                max_concurrent_messages: limits.max_concurrent_messages.max(1),
                max_receive_count: limits.max_receive_count.max(1),
                ..limits
            },
            liveness,
        }
    }

    /// Run until `cancel` is cancelled.
    ///
    /// Cancelling interrupts a poll that is waiting for messages, but a batch that was received is
    /// always processed to the end.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker = %self.name, "starting login worker");
        self.liveness.report_healthy();

        while !cancel.is_cancelled() {
            let messages = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.consumer.poll(self.limits.batch_size) => result,
            };

            match messages {
                Ok(messages) => {
                    // Skipped after a failed poll, so an unreachable source stalls the worker.
                    self.liveness.report_healthy();
                    self.process_messages(messages).await;
                }
                Err(error) => {
                    metrics::counter!("login_poll_failures").increment(1);
                    error!(worker = %self.name, error = %error, "failed to poll for login events");

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.limits.poll_backoff) => {},
                    }
                }
            }
        }

        info!(worker = %self.name, "login worker stopped");
    }

    /// Poll one batch and process it.
    ///
    /// A poll that fails returns `ConsumerError::SourceUnavailable`: no message was claimed, so
    /// nothing needs undoing.
    pub async fn process_batch(&self) -> Result<BatchSummary, ConsumerError> {
        let messages = self.consumer.poll(self.limits.batch_size).await?;

        Ok(self.process_messages(messages).await)
    }

    /// Process messages already claimed from the queue, independently of one another.
    pub async fn process_messages(&self, messages: Vec<QueueMessage>) -> BatchSummary {
        if messages.is_empty() {
            return BatchSummary::default();
        }

        let start = time::Instant::now();
        metrics::counter!("login_messages_received").increment(messages.len() as u64);

        let reports: Vec<MessageReport> = stream::iter(messages)
            .map(|message| self.process_message(message))
            .buffer_unordered(self.limits.max_concurrent_messages)
            .collect()
            .await;

        let summary = reports
            .into_iter()
            .fold(BatchSummary::default(), |mut summary, report| {
                summary.record(report);
                summary
            });

        metrics::histogram!("login_batch_processing_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        info!(
            worker = %self.name,
            received = summary.received,
            persisted = summary.persisted,
            duplicates = summary.duplicates,
            dead_lettered = summary.dead_lettered,
            redelivery = summary.redelivery,
            ack_failures = summary.ack_failures,
            "processed batch of login events"
        );

        summary
    }

    async fn process_message(&self, message: QueueMessage) -> MessageReport {
        let masked = match normalize(&message.body) {
            Ok(masked) => masked,
            Err(error) => {
                warn!(
                    message_id = %message.message_id,
                    error = %error,
                    "login event is invalid"
                );
                return self
                    .dead_letter(&message, error.kind(), &error.to_string())
                    .await;
            }
        };

        let record = masked.into_record(&message.message_id, Utc::now());

        match self.writer.write(&record).await {
            Ok(WriteOutcome::Persisted) => {
                metrics::counter!("login_records_persisted").increment(1);
                self.acknowledge(&message, MessageOutcome::Persisted).await
            }
            Ok(WriteOutcome::AlreadyApplied) => {
                metrics::counter!("login_records_duplicate").increment(1);
                self.acknowledge(&message, MessageOutcome::Duplicate).await
            }
            Err(error) if message.receive_count >= self.limits.max_receive_count => {
                error!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %error,
                    "giving up on login event after too many deliveries"
                );
                self.dead_letter(&message, error.kind(), &error.to_string())
                    .await
            }
            Err(error) => {
                metrics::counter!("login_messages_redelivery", "reason" => error.kind())
                    .increment(1);
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %error,
                    "failed to write login event, leaving it for redelivery"
                );
                MessageReport {
                    outcome: MessageOutcome::Redelivery,
                    ack: AckStatus::NotAttempted,
                }
            }
        }
    }

    /// Store the message as a dead letter, then acknowledge it. If the dead letter can't be
    /// stored the message stays on the queue.
    async fn dead_letter(
        &self,
        message: &QueueMessage,
        kind: &'static str,
        reason: &str,
    ) -> MessageReport {
        let letter = DeadLetter::new(&message.message_id, &message.body, reason);

        let result = tokio::time::timeout(
            self.limits.dead_letter_timeout,
            self.dead_letters.send(&letter),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                metrics::counter!("login_messages_dead_lettered", "reason" => kind).increment(1);
                self.acknowledge(message, MessageOutcome::DeadLettered).await
            }
            Ok(Err(error)) => self.dead_letter_failed(message, &error.to_string()),
            Err(_) => self.dead_letter_failed(message, "timed out"),
        }
    }

    fn dead_letter_failed(&self, message: &QueueMessage, error: &str) -> MessageReport {
        metrics::counter!("login_messages_redelivery", "reason" => "dead_letter_unavailable")
            .increment(1);
        error!(
            message_id = %message.message_id,
            error,
            "failed to store dead letter, leaving login event for redelivery"
        );

        MessageReport {
            outcome: MessageOutcome::Redelivery,
            ack: AckStatus::NotAttempted,
        }
    }

    async fn acknowledge(&self, message: &QueueMessage, outcome: MessageOutcome) -> MessageReport {
        let ack = match self.consumer.acknowledge(&message.token).await {
            Ok(()) => AckStatus::Acknowledged,
            Err(AckError::TokenExpired) => {
                // The lease went to another delivery, which will write nothing new and ack it.
                metrics::counter!("login_ack_failures", "reason" => "token_expired").increment(1);
                warn!(
                    message_id = %message.message_id,
                    "receipt token expired before the login event was acknowledged"
                );
                AckStatus::Failed
            }
            Err(error @ AckError::Unavailable(_)) => {
                metrics::counter!("login_ack_failures", "reason" => "unavailable").increment(1);
                error!(
                    message_id = %message.message_id,
                    error = %error,
                    "failed to acknowledge login event"
                );
                AckStatus::Failed
            }
        };

        MessageReport { outcome, ack }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_summary_counts_reports() {
        let mut summary = BatchSummary::default();

        summary.record(MessageReport {
            outcome: MessageOutcome::Persisted,
            ack: AckStatus::Acknowledged,
        });
        summary.record(MessageReport {
            outcome: MessageOutcome::Duplicate,
            ack: AckStatus::Failed,
        });
        summary.record(MessageReport {
            outcome: MessageOutcome::Redelivery,
            ack: AckStatus::NotAttempted,
        });

        assert_eq!(
            summary,
            BatchSummary {
                received: 3,
                persisted: 1,
                duplicates: 1,
                dead_lettered: 0,
                redelivery: 1,
                acknowledged: 1,
                ack_failures: 1,
            }
        );
    }
}
