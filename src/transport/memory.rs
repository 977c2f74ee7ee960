//! In-memory queue transport for tests and standalone use.
//!
//! Models the visibility-timeout semantics of a cloud queue inside one
//! process: received messages become invisible until their deadline, a
//! visibility change moves the deadline, and undeleted messages are
//! redelivered with an incremented receive count. Delete and visibility
//! calls are recorded so tests can assert on the exact ack/nack traffic.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueName, QueueTransport, RawMessage, TransportError};

/// Granularity of the receive poll while waiting for messages.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    subject: Option<String>,
    receive_count: u32,
    attributes: HashMap<String, String>,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
    deleted: Vec<String>,
    visibility_changes: Vec<(String, Duration)>,
}

/// In-process [`QueueTransport`] with visibility-timeout semantics.
pub struct InMemoryQueue {
    queue: QueueName,
    default_visibility: Duration,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(queue: impl Into<QueueName>) -> Self {
        Self {
            queue: queue.into(),
            default_visibility: Duration::from_secs(30),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Visibility window applied when a message is received and neither
    /// deleted nor explicitly re-timed.
    pub fn with_default_visibility(mut self, visibility: Duration) -> Self {
        self.default_visibility = visibility;
        self
    }

    /// Enqueue a message under a subject.
    pub async fn send(&self, subject: &str, body: impl Into<String>) -> String {
        self.enqueue(Some(subject.to_string()), body.into()).await
    }

    /// Enqueue a message with no subject in its envelope.
    pub async fn send_without_subject(&self, body: impl Into<String>) -> String {
        self.enqueue(None, body.into()).await
    }

    async fn enqueue(&self, subject: Option<String>, body: String) -> String {
        let message_id = Uuid::new_v4().to_string();
        let stored = StoredMessage {
            message_id: message_id.clone(),
            body,
            subject,
            receive_count: 0,
            attributes: HashMap::new(),
        };
        self.inner.lock().await.ready.push_back(stored);
        self.notify.notify_waiters();
        message_id
    }

    /// Receipt handles of deleted messages, in deletion order.
    pub async fn deleted(&self) -> Vec<String> {
        self.inner.lock().await.deleted.clone()
    }

    pub async fn deleted_count(&self) -> usize {
        self.inner.lock().await.deleted.len()
    }

    /// `(receipt_handle, timeout)` pairs from visibility changes, in call order.
    pub async fn visibility_changes(&self) -> Vec<(String, Duration)> {
        self.inner.lock().await.visibility_changes.clone()
    }

    pub async fn visibility_change_count(&self) -> usize {
        self.inner.lock().await.visibility_changes.len()
    }

    /// Messages currently eligible for receive.
    pub async fn ready_len(&self) -> usize {
        let mut inner = self.inner.lock().await;
        Self::promote_due(&mut inner);
        inner.ready.len()
    }

    /// Messages received but neither deleted nor past their deadline.
    pub async fn in_flight_len(&self) -> usize {
        let mut inner = self.inner.lock().await;
        Self::promote_due(&mut inner);
        inner.in_flight.len()
    }

    fn promote_due(inner: &mut Inner) {
        let now = Instant::now();
        let due: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in due {
            if let Some(in_flight) = inner.in_flight.remove(&receipt) {
                inner.ready.push_back(in_flight.message);
            }
        }
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    fn queue(&self) -> &QueueName {
        &self.queue
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, TransportError> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut inner = self.inner.lock().await;
                Self::promote_due(&mut inner);

                if !inner.ready.is_empty() {
                    let mut batch = Vec::new();
                    while batch.len() < max_messages.max(1) {
                        let Some(mut stored) = inner.ready.pop_front() else {
                            break;
                        };
                        stored.receive_count += 1;
                        let receipt_handle = Uuid::new_v4().to_string();
                        batch.push(RawMessage {
                            message_id: stored.message_id.clone(),
                            body: stored.body.clone(),
                            subject: stored.subject.clone(),
                            receipt_handle: receipt_handle.clone(),
                            receive_count: stored.receive_count,
                            queue: self.queue.clone(),
                            attributes: stored.attributes.clone(),
                            received_at: Utc::now(),
                        });
                        inner.in_flight.insert(
                            receipt_handle,
                            InFlight {
                                message: stored,
                                visible_at: Instant::now() + self.default_visibility,
                            },
                        );
                    }
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let remaining = deadline - now;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining.min(POLL_INTERVAL)) => {}
            }
        }
    }

    async fn delete(&self, message: &RawMessage) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.remove(&message.receipt_handle).is_none() {
            return Err(TransportError::Delete(format!(
                "unknown receipt handle: {}",
                message.receipt_handle
            )));
        }
        inner.deleted.push(message.receipt_handle.clone());
        Ok(())
    }

    async fn change_visibility(
        &self,
        message: &RawMessage,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let Some(in_flight) = inner.in_flight.get_mut(&message.receipt_handle) else {
            return Err(TransportError::ChangeVisibility(format!(
                "unknown receipt handle: {}",
                message.receipt_handle
            )));
        };
        in_flight.visible_at = Instant::now() + timeout;
        inner
            .visibility_changes
            .push((message.receipt_handle.clone(), timeout));
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let queue = InMemoryQueue::new("orders");
        queue.send("OrderAccepted", r#"{"order_id":"o-1"}"#).await;

        let batch = queue.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject.as_deref(), Some("OrderAccepted"));
        assert_eq!(batch[0].receive_count, 1);
        assert_eq!(batch[0].queue, QueueName::from("orders"));
    }

    #[tokio::test]
    async fn test_empty_receive_is_not_an_error() {
        let queue = InMemoryQueue::new("orders");
        let batch = queue.receive(10, Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_received_message_is_invisible_until_deadline() {
        let queue =
            InMemoryQueue::new("orders").with_default_visibility(Duration::from_millis(60));
        queue.send("OrderAccepted", "{}").await;

        let first = queue.receive(10, Duration::from_millis(20)).await.unwrap();
        assert_eq!(first.len(), 1);

        // Still invisible.
        let second = queue.receive(10, Duration::from_millis(20)).await.unwrap();
        assert!(second.is_empty());

        // Redelivered after the deadline with an incremented count.
        let third = queue.receive(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].receive_count, 2);
    }

    #[tokio::test]
    async fn test_delete_prevents_redelivery() {
        let queue =
            InMemoryQueue::new("orders").with_default_visibility(Duration::from_millis(30));
        queue.send("OrderAccepted", "{}").await;

        let batch = queue.receive(10, Duration::from_millis(20)).await.unwrap();
        queue.delete(&batch[0]).await.unwrap();

        let redelivered = queue.receive(10, Duration::from_millis(80)).await.unwrap();
        assert!(redelivered.is_empty());
        assert_eq!(queue.deleted().await, vec![batch[0].receipt_handle.clone()]);
    }

    #[tokio::test]
    async fn test_change_visibility_reschedules_redelivery() {
        let queue = InMemoryQueue::new("orders").with_default_visibility(Duration::from_secs(60));
        queue.send("OrderAccepted", "{}").await;

        let batch = queue.receive(10, Duration::from_millis(20)).await.unwrap();
        queue
            .change_visibility(&batch[0], Duration::from_millis(40))
            .await
            .unwrap();

        let redelivered = queue.receive(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receive_count, 2);
        assert_eq!(
            queue.visibility_changes().await,
            vec![(batch[0].receipt_handle.clone(), Duration::from_millis(40))]
        );
    }

    #[tokio::test]
    async fn test_delete_with_unknown_receipt_fails() {
        let queue = InMemoryQueue::new("orders");
        queue.send("OrderAccepted", "{}").await;
        let mut batch = queue.receive(10, Duration::from_millis(20)).await.unwrap();
        batch[0].receipt_handle = "bogus".to_string();

        assert!(matches!(
            queue.delete(&batch[0]).await,
            Err(TransportError::Delete(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_respects_max_messages() {
        let queue = InMemoryQueue::new("orders");
        for i in 0..5 {
            queue.send("OrderAccepted", format!("{{\"n\":{}}}", i)).await;
        }

        let batch = queue.receive(2, Duration::from_millis(20)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.ready_len().await, 3);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let queue = std::sync::Arc::new(InMemoryQueue::new("orders"));
        let receiver = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.receive(10, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.send("OrderAccepted", "{}").await;

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }
}
