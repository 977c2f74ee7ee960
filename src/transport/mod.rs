//! Queue transport abstraction.
//!
//! A [`QueueTransport`] owns the connection to one queue and exposes the
//! three operations the bus needs: receive a batch, delete (ack), and
//! change a message's visibility window (nack). Implementations:
//! - [`sqs::SqsQueue`]: AWS SQS
//! - [`memory::InMemoryQueue`]: in-process queue for tests and standalone use

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod sqs;

pub use memory::InMemoryQueue;
pub use sqs::{SqsConfig, SqsQueue};

/// Message attribute carrying the wire subject on SQS/SNS messages.
pub const SUBJECT_ATTR: &str = "subject";

/// Identity of one queue subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Transport-level message envelope, prior to decoding.
///
/// Owned by the transport; the dispatcher holds it only for the duration
/// of one dispatch. `receive_count` is 1-based and maintained by the
/// transport across redeliveries - the transport is the source of truth
/// for delivery attempts.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub message_id: String,
    pub body: String,
    /// Wire subject from the envelope, used to select the decoder.
    pub subject: Option<String>,
    /// Opaque ack token for delete/visibility calls.
    pub receipt_handle: String,
    pub receive_count: u32,
    pub queue: QueueName,
    pub attributes: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Delete failed: {0}")]
    Delete(String),

    #[error("Visibility change failed: {0}")]
    ChangeVisibility(String),
}

/// Connection to one queue.
///
/// An empty receive is a normal poll outcome, not an error. Exactly one of
/// `delete` or `change_visibility` is issued per dispatched message.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// The queue this transport is bound to.
    fn queue(&self) -> &QueueName;

    /// Receive up to `max_messages`, waiting up to `wait` when empty.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, TransportError>;

    /// Permanently remove an acknowledged message.
    async fn delete(&self, message: &RawMessage) -> Result<(), TransportError>;

    /// Hide a message from other receivers for `timeout`, after which it
    /// becomes eligible for redelivery.
    async fn change_visibility(
        &self,
        message: &RawMessage,
        timeout: Duration,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_display() {
        let queue = QueueName::new("orders");
        assert_eq!(queue.to_string(), "orders");
        assert_eq!(queue.as_str(), "orders");
    }

    #[test]
    fn test_queue_name_equality() {
        assert_eq!(QueueName::from("orders"), QueueName::new("orders"));
        assert_ne!(QueueName::from("orders"), QueueName::from("Orders"));
    }
}
