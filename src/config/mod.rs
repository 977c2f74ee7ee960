//! Bus configuration.
//!
//! Loaded from YAML files and `HERALD`-prefixed environment variables into
//! one [`BusConfig`]. Subscription entries carry per-queue receive tuning;
//! the AWS section feeds the SQS transport and SNS publisher.

use std::time::Duration;

use serde::Deserialize;

use crate::listener::ListenerConfig;
use crate::publish::SnsConfig;
use crate::transport::SqsConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "herald.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HERALD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HERALD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HERALD_LOG";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main bus configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// AWS client settings shared by the transport and publisher.
    pub aws: AwsClientConfig,
    /// Queue subscriptions to consume from.
    pub subscriptions: Vec<SubscriptionConfig>,
    /// Publisher settings.
    pub publisher: PublisherConfig,
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources (in order of priority, later overrides earlier):
    /// 1. `herald.yaml` in the current directory (if it exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `HERALD_CONFIG` environment variable (if set)
    /// 4. Environment variables with the `HERALD` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// SQS transport settings derived from the AWS section.
    pub fn sqs_config(&self) -> SqsConfig {
        SqsConfig {
            region: self.aws.region.clone(),
            endpoint_url: self.aws.endpoint_url.clone(),
        }
    }

    /// SNS publisher settings derived from the AWS and publisher sections.
    pub fn sns_config(&self) -> SnsConfig {
        SnsConfig {
            region: self.aws.region.clone(),
            endpoint_url: self.aws.endpoint_url.clone(),
            topic_prefix: self.publisher.topic_prefix.clone(),
        }
    }
}

/// AWS client settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AwsClientConfig {
    /// AWS region. Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
}

/// One queue subscription.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Queue name to consume from.
    pub queue: String,
    /// Max messages per receive call (SQS caps this at 10).
    pub max_messages: usize,
    /// Long-poll wait in seconds when the queue is empty.
    pub wait_time_secs: u64,
    /// Max concurrently in-flight dispatches for this queue.
    pub concurrency: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            max_messages: 10,
            wait_time_secs: 20,
            concurrency: 8,
        }
    }
}

impl SubscriptionConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_wait_time_secs(mut self, wait_time_secs: u64) -> Self {
        self.wait_time_secs = wait_time_secs;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Listener tuning for this subscription.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig::default()
            .with_max_messages(self.max_messages)
            .with_wait_time(Duration::from_secs(self.wait_time_secs))
            .with_concurrency(self.concurrency)
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Topic prefix for published subjects.
    pub topic_prefix: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "herald".to_string(),
        }
    }
}
