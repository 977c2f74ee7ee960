//! Bus composition and lifecycle.
//!
//! A [`Bus`] owns one [`QueueListener`] per subscribed queue and starts and
//! stops them together. Assembly happens through [`BusBuilder`] before
//! `start`; the handler and serialization registries are immutable once
//! the bus is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backoff::{BackoffStrategy, DefaultBackoff};
use crate::dispatch::{DispatchError, Dispatcher, ErrorCallback, UnhandledPolicy};
use crate::handlers::HandlerRegistry;
use crate::listener::{ListenerConfig, QueueListener};
use crate::monitor::{Monitor, NoopMonitor};
use crate::serialization::SerializationRegister;
use crate::transport::{QueueTransport, RawMessage};

/// Errors that can occur during bus lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus already started")]
    AlreadyStarted,

    #[error("no queue subscriptions configured")]
    NoSubscriptions,
}

/// Concurrent multi-queue consumer.
pub struct Bus {
    monitor: Arc<dyn Monitor>,
    token: CancellationToken,
    listeners: Mutex<Vec<QueueListener>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    /// The shared observability sink, for aggregate throughput/error views
    /// across all queues.
    pub fn monitor(&self) -> Arc<dyn Monitor> {
        Arc::clone(&self.monitor)
    }

    /// Token cancelled when the bus stops; clone it to tie other work to
    /// the bus lifetime.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Launch every queue listener. Returns once all are running.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut listeners = self.listeners.lock().await;
        if listeners.is_empty() {
            return Err(BusError::NoSubscriptions);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyStarted);
        }

        let mut handles = self.handles.lock().await;
        for listener in listeners.drain(..) {
            info!(queue = %listener.queue(), "Starting queue listener");
            let token = self.token.child_token();
            handles.push(tokio::spawn(listener.run(token)));
        }

        info!(listener_count = handles.len(), "Bus started");
        Ok(())
    }

    /// Signal cancellation to every listener and in-flight dispatch, then
    /// wait for them to drain.
    pub async fn stop(&self) {
        self.token.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Listener task failed");
            }
        }
        info!("Bus stopped");
    }
}

/// Assembles a [`Bus`] from its collaborators.
pub struct BusBuilder {
    serialization: Arc<SerializationRegister>,
    handlers: HandlerRegistry,
    backoff: Arc<dyn BackoffStrategy>,
    monitor: Arc<dyn Monitor>,
    on_error: Option<ErrorCallback>,
    unhandled: UnhandledPolicy,
    listener_config: ListenerConfig,
    subscriptions: Vec<(Arc<dyn QueueTransport>, ListenerConfig)>,
    parent_token: Option<CancellationToken>,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BusBuilder {
    pub fn new() -> Self {
        Self {
            serialization: Arc::new(SerializationRegister::new()),
            handlers: HandlerRegistry::new(),
            backoff: Arc::new(DefaultBackoff::default()),
            monitor: Arc::new(NoopMonitor),
            on_error: None,
            unhandled: UnhandledPolicy::default(),
            listener_config: ListenerConfig::default(),
            subscriptions: Vec::new(),
            parent_token: None,
        }
    }

    pub fn serialization(mut self, serialization: impl Into<Arc<SerializationRegister>>) -> Self {
        self.serialization = serialization.into();
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn backoff(mut self, backoff: impl BackoffStrategy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Callback invoked once per nacked dispatch.
    pub fn on_error(
        mut self,
        callback: impl Fn(Option<&DispatchError>, &RawMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn unhandled_policy(mut self, policy: UnhandledPolicy) -> Self {
        self.unhandled = policy;
        self
    }

    /// Default receive/fan-out tuning applied to later `subscribe` calls.
    pub fn listener_config(mut self, config: ListenerConfig) -> Self {
        self.listener_config = config;
        self
    }

    /// Subscribe to a queue with the current default listener config.
    pub fn subscribe(self, transport: Arc<dyn QueueTransport>) -> Self {
        let config = self.listener_config.clone();
        self.subscribe_with(transport, config)
    }

    /// Subscribe to a queue with explicit listener config.
    pub fn subscribe_with(
        mut self,
        transport: Arc<dyn QueueTransport>,
        config: ListenerConfig,
    ) -> Self {
        self.subscriptions.push((transport, config));
        self
    }

    /// Tie the bus lifetime to an external cancellation signal.
    pub fn cancellation_token(mut self, parent: CancellationToken) -> Self {
        self.parent_token = Some(parent);
        self
    }

    pub fn build(self) -> Bus {
        let mut dispatcher = Dispatcher::new(
            self.serialization,
            Arc::new(self.handlers),
            self.backoff,
            Arc::clone(&self.monitor),
        )
        .with_unhandled_policy(self.unhandled);
        if let Some(callback) = self.on_error {
            dispatcher = dispatcher.with_error_callback(callback);
        }

        let listeners = self
            .subscriptions
            .into_iter()
            .map(|(transport, config)| {
                QueueListener::new(
                    transport,
                    dispatcher.clone(),
                    Arc::clone(&self.monitor),
                    config,
                )
            })
            .collect();

        let token = self
            .parent_token
            .map(|parent| parent.child_token())
            .unwrap_or_default();

        Bus {
            monitor: self.monitor,
            token,
            listeners: Mutex::new(listeners),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }
}
