//! AWS SQS queue transport.
//!
//! Resolves the queue URL once at connection time and maps the three bus
//! operations onto `ReceiveMessage`, `DeleteMessage`, and
//! `ChangeMessageVisibility`. The wire subject is read from the `subject`
//! message attribute; messages fanned out from SNS without raw message
//! delivery arrive wrapped in a JSON notification envelope, which is
//! detected and unwrapped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use chrono::Utc;
use tracing::{info, warn};

use super::{QueueName, QueueTransport, RawMessage, TransportError, SUBJECT_ATTR};

/// SQS limits a single receive to 10 messages.
const MAX_BATCH: usize = 10;
/// SQS long-poll wait is capped at 20 seconds.
const MAX_WAIT_SECS: u64 = 20;
/// SQS visibility timeout is capped at 12 hours.
const MAX_VISIBILITY_SECS: u64 = 43_200;

/// Configuration for the AWS SQS connection.
#[derive(Clone, Debug, Default)]
pub struct SqsConfig {
    /// AWS region (e.g., "us-east-1"). Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
}

impl SqsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set AWS region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set custom endpoint URL (for LocalStack or testing).
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }
}

/// AWS SQS implementation of [`QueueTransport`].
pub struct SqsQueue {
    client: SqsClient,
    queue: QueueName,
    queue_url: String,
}

impl SqsQueue {
    /// Connect to an existing queue by name.
    ///
    /// The queue must already exist; provisioning is a deployment concern,
    /// not a bus concern.
    pub async fn connect(config: &SqsConfig, queue: QueueName) -> Result<Self, TransportError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let aws_config = loader.load().await;
        let client = SqsClient::new(&aws_config);

        let queue_url = client
            .get_queue_url()
            .queue_name(queue.as_str())
            .send()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to resolve queue URL: {}", e)))?
            .queue_url()
            .ok_or_else(|| {
                TransportError::Connection("SQS get_queue_url returned no URL".to_string())
            })?
            .to_string();

        info!(queue = %queue, url = %queue_url, "Connected to SQS queue");

        Ok(Self {
            client,
            queue,
            queue_url,
        })
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    fn convert(&self, message: aws_sdk_sqs::types::Message) -> Option<RawMessage> {
        let body = message.body.clone()?;
        let Some(receipt_handle) = message.receipt_handle.clone() else {
            warn!(queue = %self.queue, "Received SQS message without receipt handle, skipping");
            return None;
        };

        let receive_count = parse_receive_count(
            message
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .map(String::as_str),
        );

        let mut subject = message
            .message_attributes
            .as_ref()
            .and_then(|attrs| attrs.get(SUBJECT_ATTR))
            .and_then(|v| v.string_value())
            .map(str::to_string);

        // Messages from SNS without RawMessageDelivery carry the subject and
        // payload inside a notification envelope.
        let body = if subject.is_none() {
            match unwrap_sns_envelope(&body) {
                Some((envelope_subject, inner)) => {
                    subject = envelope_subject;
                    inner
                }
                None => body,
            }
        } else {
            body
        };

        let attributes = message
            .attributes
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key.as_str().to_string(), value))
            .collect::<HashMap<_, _>>();

        Some(RawMessage {
            message_id: message.message_id.unwrap_or_default(),
            body,
            subject,
            receipt_handle,
            receive_count,
            queue: self.queue.clone(),
            attributes,
            received_at: Utc::now(),
        })
    }
}

#[async_trait]
impl QueueTransport for SqsQueue {
    fn queue(&self) -> &QueueName {
        &self.queue
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, TransportError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, MAX_BATCH) as i32)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECS) as i32)
            .message_attribute_names("All")
            .attribute_names(QueueAttributeName::All)
            .send()
            .await
            .map_err(|e| TransportError::Receive(format!("Failed to receive from SQS: {}", e)))?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| self.convert(message))
            .collect())
    }

    async fn delete(&self, message: &RawMessage) -> Result<(), TransportError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt_handle)
            .send()
            .await
            .map_err(|e| TransportError::Delete(format!("Failed to delete SQS message: {}", e)))?;
        Ok(())
    }

    async fn change_visibility(
        &self,
        message: &RawMessage,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt_handle)
            .visibility_timeout(timeout.as_secs().min(MAX_VISIBILITY_SECS) as i32)
            .send()
            .await
            .map_err(|e| {
                TransportError::ChangeVisibility(format!(
                    "Failed to change SQS message visibility: {}",
                    e
                ))
            })?;
        Ok(())
    }
}

/// Parse SQS's `ApproximateReceiveCount`, defaulting to 1 (first delivery).
fn parse_receive_count(value: Option<&str>) -> u32 {
    value.and_then(|s| s.parse().ok()).unwrap_or(1).max(1)
}

/// Unwrap an SNS notification envelope, returning `(subject, inner_body)`.
///
/// Returns `None` when the body is not an SNS notification, in which case
/// the original body should be used as-is.
fn unwrap_sns_envelope(body: &str) -> Option<(Option<String>, String)> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    if value.get("Type").and_then(|t| t.as_str()) != Some("Notification") {
        return None;
    }
    let inner = value.get("Message")?.as_str()?.to_string();
    let subject = value
        .get("Subject")
        .and_then(|s| s.as_str())
        .map(str::to_string);
    Some((subject, inner))
}
