//! # SQS
//!
//! `MessageSource` backed by an Amazon SQS queue (or anything that speaks its API, like
//! localstack in development).
use std::time;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::operation::delete_message::DeleteMessageError;
use aws_sdk_sqs::operation::receive_message::ReceiveMessageError;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use tracing::warn;

use crate::queue::{AckError, MessageSource, QueueMessage, SourceError, MAX_BATCH_SIZE};

/// SQS won't long-poll for longer than this.
const MAX_WAIT_TIME: time::Duration = time::Duration::from_secs(20);

pub struct SqsSource {
    client: Client,
    queue_url: String,
    visibility_timeout: time::Duration,
}

impl SqsSource {
    pub fn new(client: Client, queue_url: &str, visibility_timeout: time::Duration) -> Self {
        Self {
            client,
            queue_url: queue_url.to_owned(),
            visibility_timeout,
        }
    }

    /// Build a client from the environment's AWS credentials chain.
    /// `endpoint_url` overrides the default AWS endpoint, e.g. to point at localstack.
    pub async fn from_env(
        queue_url: &str,
        region: &str,
        endpoint_url: Option<&str>,
        visibility_timeout: time::Duration,
    ) -> Self {
        let mut aws_config_builder =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_owned()));

        if let Some(endpoint) = endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        Self::new(Client::new(&aws_config), queue_url, visibility_timeout)
    }

    /// Check that the queue exists and we are allowed to use it.
    pub async fn check(&self) -> Result<(), SourceError> {
        self.client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|error| SourceError::Fatal(DisplayErrorContext(&error).to_string()))?;

        Ok(())
    }
}

fn seconds(duration: time::Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl MessageSource for SqsSource {
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: time::Duration,
    ) -> Result<Vec<QueueMessage>, SourceError> {
        let max_messages = max_messages.clamp(1, MAX_BATCH_SIZE);

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages as i32)
            .wait_time_seconds(seconds(wait_time.min(MAX_WAIT_TIME)))
            .visibility_timeout(seconds(self.visibility_timeout))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|error| {
                let reason = DisplayErrorContext(&error).to_string();
                match error.as_service_error() {
                    Some(ReceiveMessageError::QueueDoesNotExist(_)) => SourceError::Fatal(reason),
                    _ => SourceError::Transient(reason),
                }
            })?;

        let mut messages = Vec::with_capacity(max_messages);

        for message in output.messages() {
            let (Some(message_id), Some(token), Some(body)) =
                (message.message_id(), message.receipt_handle(), message.body())
            else {
                warn!(
                    message_id = ?message.message_id(),
                    "skipping SQS message without id, receipt handle or body"
                );
                continue;
            };

            let receive_count = message
                .attributes()
                .and_then(|attributes| {
                    attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount)
                })
                .and_then(|count| count.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                message_id: message_id.to_owned(),
                token: token.to_owned(),
                body: body.as_bytes().to_vec(),
                receive_count,
            });
        }

        Ok(messages)
    }

    async fn delete(&self, token: &str) -> Result<(), AckError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(token)
            .send()
            .await
            .map_err(|error| match error.as_service_error() {
                Some(DeleteMessageError::ReceiptHandleIsInvalid(_)) => AckError::TokenExpired,
                _ => AckError::Unavailable(DisplayErrorContext(&error).to_string()),
            })?;

        Ok(())
    }
}
