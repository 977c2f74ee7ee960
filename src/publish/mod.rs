//! Message publishing.
//!
//! The encode half of the serialization register, driven end-to-end: a
//! [`Publisher`] turns a typed message into a subject-tagged payload and
//! hands it to the wire. [`SnsPublisher`] maps each subject to its own SNS
//! topic so SQS queues can subscribe per message type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::types::MessageAttributeValue;
use aws_sdk_sns::Client as SnsClient;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::serialization::{Message, SerializationError, SerializationRegister};
use crate::transport::SUBJECT_ATTR;

/// Errors that can occur while publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

/// Publishes typed messages to the wire.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &dyn Message) -> Result<(), PublishError>;
}

/// Configuration for the AWS SNS connection.
#[derive(Clone, Debug)]
pub struct SnsConfig {
    /// AWS region (e.g., "us-east-1"). Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
    /// Topic prefix (default: "herald").
    pub topic_prefix: String,
}

impl Default for SnsConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_url: None,
            topic_prefix: "herald".to_string(),
        }
    }
}

impl SnsConfig {
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

    /// Set topic prefix.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Build the SNS topic name for a subject.
    /// Uses dashes instead of dots for AWS compatibility.
    pub fn topic_for_subject(&self, subject: &str) -> String {
        let sanitized = subject.replace('.', "-");
        format!("{}-{}", self.topic_prefix, sanitized)
    }
}

/// AWS SNS implementation of [`Publisher`].
///
/// Messages are published to one topic per subject, named
/// `{topic_prefix}-{subject}`. The subject travels as a message attribute
/// so raw-delivery SQS subscribers can route without parsing the body.
pub struct SnsPublisher {
    sns: SnsClient,
    serialization: Arc<SerializationRegister>,
    config: SnsConfig,
    /// Cache of SNS topic ARNs by topic name.
    topic_arns: RwLock<HashMap<String, String>>,
}

impl SnsPublisher {
    pub async fn new(
        config: SnsConfig,
        serialization: Arc<SerializationRegister>,
    ) -> Result<Self, PublishError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let aws_config = loader.load().await;
        let sns = SnsClient::new(&aws_config);

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            topic_prefix = %config.topic_prefix,
            "Connected to SNS"
        );

        Ok(Self {
            sns,
            serialization,
            config,
            topic_arns: RwLock::new(HashMap::new()),
        })
    }

    /// Get or create the SNS topic ARN for a subject.
    async fn get_or_create_topic(&self, subject: &str) -> Result<String, PublishError> {
        let topic_name = self.config.topic_for_subject(subject);

        {
            let arns = self.topic_arns.read().await;
            if let Some(arn) = arns.get(&topic_name) {
                return Ok(arn.clone());
            }
        }

        // create_topic is idempotent - returns the existing topic's ARN.
        let result = self
            .sns
            .create_topic()
            .name(&topic_name)
            .send()
            .await
            .map_err(|e| PublishError::Failed(format!("Failed to create SNS topic: {}", e)))?;

        let arn = result
            .topic_arn()
            .ok_or_else(|| PublishError::Failed("SNS create_topic returned no ARN".to_string()))?
            .to_string();

        {
            let mut arns = self.topic_arns.write().await;
            arns.insert(topic_name.clone(), arn.clone());
        }

        info!(topic = %topic_name, arn = %arn, "Created/found SNS topic");
        Ok(arn)
    }
}

#[async_trait]
impl Publisher for SnsPublisher {
    async fn publish(&self, message: &dyn Message) -> Result<(), PublishError> {
        let (subject, payload) = self.serialization.encode(message)?;
        let topic_arn = self.get_or_create_topic(&subject).await?;

        let subject_attr = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(&subject)
            .build()
            .map_err(|e| PublishError::Failed(format!("Failed to build attribute: {}", e)))?;

        self.sns
            .publish()
            .topic_arn(&topic_arn)
            .message(&payload)
            .subject(&subject)
            .message_attributes(SUBJECT_ATTR, subject_attr)
            .send()
            .await
            .map_err(|e| PublishError::Failed(format!("Failed to publish to SNS: {}", e)))?;

        debug!(subject = %subject, topic_arn = %topic_arn, "Published message");
        Ok(())
    }
}
