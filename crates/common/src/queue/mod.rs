//! SQS Queue integration for async job processing
//!
//! Provides:
//! - SQS client wrapper with retry on send
//! - Message serialization/deserialization
//! - Dead letter queue handling (via the queue's redrive policy)

use crate::config::QueueConfig;
use crate::errors::{AppError, Result};
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use backoff::{future::retry, ExponentialBackoff};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Connection settings for one queue
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Queue URL
    pub url: String,
    /// Dead letter queue URL (optional)
    pub dlq_url: Option<String>,
    /// Visibility timeout in seconds
    pub visibility_timeout: i32,
    /// Wait time for long polling (seconds)
    pub wait_time_seconds: i32,
    /// Maximum number of messages per poll
    pub max_messages: i32,
}

impl QueueOptions {
    /// Options for the generation queue; `None` when no queue is configured
    pub fn generation(config: &QueueConfig) -> Option<Self> {
        let url = config.generation_queue_url.clone().filter(|u| !u.trim().is_empty())?;
        Some(Self {
            url,
            dlq_url: config.dlq_url.clone(),
            visibility_timeout: clamp_i32(config.visibility_timeout_secs),
            // SQS caps long polling at 20s and batches at 10 messages
            wait_time_seconds: clamp_i32(config.poll_timeout_secs).min(20),
            max_messages: (config.batch_size as i32).clamp(1, 10),
        })
    }
}

fn clamp_i32(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// SQS Queue client wrapper
pub struct Queue {
    client: SqsClient,
    options: QueueOptions,
}

impl Queue {
    /// Create a new queue client from the ambient AWS configuration
    pub async fn new(options: QueueOptions) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = SqsClient::new(&aws_config);

        Ok(Self { client, options })
    }

    /// Create with existing SQS client
    pub fn with_client(client: SqsClient, options: QueueOptions) -> Self {
        Self { client, options }
    }

    pub fn url(&self) -> &str {
        &self.options.url
    }

    /// Send a message to the queue, retrying transient failures
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<String> {
        let body = serde_json::to_string(message).map_err(|e| AppError::QueueError {
            message: format!("Failed to serialize message: {}", e),
        })?;

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..ExponentialBackoff::default()
        };

        let result = retry(policy, || async {
            self.client
                .send_message()
                .queue_url(&self.options.url)
                .message_body(&body)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "Queue send failed, retrying");
                    backoff::Error::transient(e)
                })
        })
        .await
        .map_err(|e| AppError::QueueError {
            message: format!("Failed to send message: {}", e),
        })?;

        let message_id = result.message_id.unwrap_or_default();
        debug!(message_id = %message_id, "Message sent to queue");

        Ok(message_id)
    }

    /// Receive messages from the queue (long poll)
    pub async fn receive(&self) -> Result<Vec<Message>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.options.url)
            .max_number_of_messages(self.options.max_messages)
            .visibility_timeout(self.options.visibility_timeout)
            .wait_time_seconds(self.options.wait_time_seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to receive messages: {}", e),
            })?;

        let messages = result.messages.unwrap_or_default();
        debug!(count = messages.len(), "Received messages from queue");

        Ok(messages)
    }

    /// Delete a message after processing
    pub async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.options.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to delete message: {}", e),
            })?;

        debug!("Message deleted from queue");
        Ok(())
    }

    /// Change visibility timeout (extend processing time)
    pub async fn extend_visibility(&self, receipt_handle: &str, seconds: i32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.options.url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to extend visibility: {}", e),
            })?;

        debug!(seconds, "Extended message visibility");
        Ok(())
    }

    /// Park an unreadable message on the DLQ, if one is configured
    pub async fn dead_letter(&self, message: &Message) -> Result<()> {
        let Some(dlq_url) = self.options.dlq_url.as_deref() else {
            return Ok(());
        };
        self.client
            .send_message()
            .queue_url(dlq_url)
            .message_body(message.body.clone().unwrap_or_default())
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to dead-letter message: {}", e),
            })?;
        Ok(())
    }

    /// Parse message body as JSON
    pub fn parse_message<T: DeserializeOwned>(message: &Message) -> Result<T> {
        let body = message.body.as_ref().ok_or_else(|| AppError::QueueError {
            message: "Message has no body".to_string(),
        })?;

        serde_json::from_str(body).map_err(|e| AppError::QueueError {
            message: format!("Failed to parse message: {}", e),
        })
    }
}

/// Generation job message; the job record holds everything else
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJobMessage {
    pub job_id: Uuid,
    pub owner_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_message_is_small() {
        let msg = GenerationJobMessage {
            job_id: Uuid::new_v4(),
            owner_id: "user-42".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        let parsed: GenerationJobMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(msg, parsed);
        assert!(json.len() < 100);
    }

    #[test]
    fn test_options_require_a_queue_url() {
        let mut config = QueueConfig::default();
        assert!(QueueOptions::generation(&config).is_none());

        config.generation_queue_url = Some("https://sqs.eu-west-1.amazonaws.com/1/gen".into());
        config.poll_timeout_secs = 60;
        config.batch_size = 50;
        let options = QueueOptions::generation(&config).unwrap();
        assert_eq!(options.wait_time_seconds, 20);
        assert_eq!(options.max_messages, 10);
    }

    #[test]
    fn test_parse_message_without_body() {
        let message = Message::builder().build();
        assert!(Queue::parse_message::<GenerationJobMessage>(&message).is_err());
    }
}
