//! Per-queue polling loop.
//!
//! One [`QueueListener`] owns one queue subscription: it receives bounded
//! batches, fans each message out to the dispatcher under a semaphore so a
//! burst cannot spawn unbounded work, and backs off with jitter when the
//! transport errors. Cancellation stops new receives and drains in-flight
//! dispatches before the loop returns.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dispatch::Dispatcher;
use crate::monitor::Monitor;
use crate::transport::{QueueName, QueueTransport};

/// Receive and fan-out tuning for one queue subscription.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Max messages per receive call.
    pub max_messages: usize,
    /// Long-poll wait when the queue is empty.
    pub wait_time: Duration,
    /// Max concurrently in-flight dispatches for this queue.
    pub concurrency: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time: Duration::from_secs(20),
            concurrency: 8,
        }
    }
}

impl ListenerConfig {
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Polling loop for one queue.
pub struct QueueListener {
    transport: Arc<dyn QueueTransport>,
    dispatcher: Dispatcher,
    monitor: Arc<dyn Monitor>,
    config: ListenerConfig,
}

impl QueueListener {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        dispatcher: Dispatcher,
        monitor: Arc<dyn Monitor>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            monitor,
            config,
        }
    }

    pub fn queue(&self) -> &QueueName {
        self.transport.queue()
    }

    /// Run until `cancel` fires, then drain in-flight dispatches.
    pub async fn run(self, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        // Backoff between failed receives, reset after a successful one.
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut receive_backoff = backoff_builder.build();

        info!(queue = %self.transport.queue(), "Queue listener started");

        'listen: loop {
            // Reap completed dispatches so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}

            let started = Instant::now();
            let received = tokio::select! {
                _ = cancel.cancelled() => break 'listen,
                received = self.transport.receive(self.config.max_messages, self.config.wait_time) => received,
            };

            let batch = match received {
                Ok(batch) => {
                    receive_backoff = backoff_builder.build();
                    self.monitor
                        .received(self.transport.queue(), batch.len(), started.elapsed());
                    batch
                }
                Err(e) => {
                    let delay = receive_backoff.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        queue = %self.transport.queue(),
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Receive failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break 'listen,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            for raw in batch {
                // Backpressure: wait for dispatch capacity before accepting
                // the next message. Cancellation here leaves the remainder
                // of the batch unacked for natural redelivery.
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break 'listen,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'listen,
                    },
                };

                let dispatcher = self.dispatcher.clone();
                let transport = Arc::clone(&self.transport);
                let cancel = cancel.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    dispatcher.dispatch(transport.as_ref(), raw, &cancel).await;
                });
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!(queue = %self.transport.queue(), "Queue listener stopped");
    }
}
