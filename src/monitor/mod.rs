//! Observability sink for bus activity.
//!
//! The [`Monitor`] trait receives handled-message timings, failures, and
//! receive-batch statistics from every listener and dispatch. It must
//! tolerate concurrent calls; implementations are shared behind an `Arc`
//! across all queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatch::DispatchError;
use crate::transport::QueueName;

/// Sink for bus observability events.
pub trait Monitor: Send + Sync {
    /// A message was dispatched and acknowledged.
    fn handled(&self, subject: &str, queue: &QueueName, elapsed: Duration);

    /// A message dispatch failed and was nacked. `subject` is `None` when
    /// the envelope carried no subject; `error` is `None` when a handler
    /// reported failure without one.
    fn handle_failed(
        &self,
        subject: Option<&str>,
        queue: &QueueName,
        elapsed: Duration,
        error: Option<&DispatchError>,
    );

    /// A receive call completed; `batch_size` may be zero.
    fn received(&self, queue: &QueueName, batch_size: usize, elapsed: Duration);
}

/// Monitor that discards all events.
#[derive(Debug, Default, Clone)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn handled(&self, _subject: &str, _queue: &QueueName, _elapsed: Duration) {}

    fn handle_failed(
        &self,
        _subject: Option<&str>,
        _queue: &QueueName,
        _elapsed: Duration,
        _error: Option<&DispatchError>,
    ) {
    }

    fn received(&self, _queue: &QueueName, _batch_size: usize, _elapsed: Duration) {}
}

/// Monitor that emits tracing events.
#[derive(Debug, Default, Clone)]
pub struct LoggingMonitor;

impl Monitor for LoggingMonitor {
    fn handled(&self, subject: &str, queue: &QueueName, elapsed: Duration) {
        debug!(
            subject = %subject,
            queue = %queue,
            elapsed_ms = %elapsed.as_millis(),
            "Message handled"
        );
    }

    fn handle_failed(
        &self,
        subject: Option<&str>,
        queue: &QueueName,
        elapsed: Duration,
        error: Option<&DispatchError>,
    ) {
        warn!(
            subject = ?subject,
            queue = %queue,
            elapsed_ms = %elapsed.as_millis(),
            error = ?error,
            "Message handling failed"
        );
    }

    fn received(&self, queue: &QueueName, batch_size: usize, elapsed: Duration) {
        if batch_size > 0 {
            debug!(
                queue = %queue,
                batch_size = batch_size,
                elapsed_ms = %elapsed.as_millis(),
                "Received batch"
            );
        }
    }
}

/// Monitor that counts events, for tests and smoke checks.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    handled: AtomicUsize,
    failed: AtomicUsize,
    batches: AtomicUsize,
    messages_received: AtomicUsize,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled_count(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn failed_count(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn messages_received(&self) -> usize {
        self.messages_received.load(Ordering::SeqCst)
    }
}

impl Monitor for RecordingMonitor {
    fn handled(&self, _subject: &str, _queue: &QueueName, _elapsed: Duration) {
        self.handled.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_failed(
        &self,
        _subject: Option<&str>,
        _queue: &QueueName,
        _elapsed: Duration,
        _error: Option<&DispatchError>,
    ) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn received(&self, _queue: &QueueName, batch_size: usize, _elapsed: Duration) {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.messages_received.fetch_add(batch_size, Ordering::SeqCst);
    }
}
