//! Per-message dispatch pipeline.
//!
//! One dispatch takes a raw transport message through
//! decode -> resolve handlers -> invoke -> ack/nack. Every failure mode is
//! converted into nack bookkeeping plus observability side effects;
//! [`Dispatcher::dispatch`] never propagates an error to its caller, so a
//! single bad message or handler bug cannot kill the listener loop that
//! dispatched it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::BackoffStrategy;
use crate::context::{self, MessageContext};
use crate::handlers::{HandlerError, HandlerRegistry};
use crate::monitor::Monitor;
use crate::serialization::{SerializationError, SerializationRegister};
use crate::transport::{QueueTransport, RawMessage};

/// Failure cause reported to the error callback and monitor.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("no handler registered for subject '{subject}'")]
    NoHandler { subject: String },
}

/// Callback invoked once per nacked dispatch with the failure cause
/// (`None` when a handler reported failure without an error) and the raw
/// message.
pub type ErrorCallback = Arc<dyn Fn(Option<&DispatchError>, &RawMessage) + Send + Sync>;

/// Terminal state of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// All handlers succeeded; the message was deleted from the queue.
    Acked,
    /// The dispatch failed; the message's visibility window was extended
    /// for a later attempt.
    Nacked,
    /// Cancellation was observed mid-dispatch. No ack or nack was issued;
    /// the message redelivers naturally once its window lapses.
    Cancelled,
}

impl DispatchOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked)
    }
}

/// What to do with a decodable message no handler is registered for.
///
/// The default is `Nack`: a decodable message nobody handles is a wiring
/// bug, and deleting it would silently break at-least-once delivery. Buses
/// that share queues with other consumers can opt into `Ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledPolicy {
    #[default]
    Nack,
    Ack,
}

enum Invocation {
    Success,
    Failed(Option<HandlerError>),
    Cancelled,
}

/// Orchestrates one message's lifecycle against its owning queue.
#[derive(Clone)]
pub struct Dispatcher {
    serialization: Arc<SerializationRegister>,
    handlers: Arc<HandlerRegistry>,
    backoff: Arc<dyn BackoffStrategy>,
    monitor: Arc<dyn Monitor>,
    on_error: Option<ErrorCallback>,
    unhandled: UnhandledPolicy,
}

impl Dispatcher {
    pub fn new(
        serialization: Arc<SerializationRegister>,
        handlers: Arc<HandlerRegistry>,
        backoff: Arc<dyn BackoffStrategy>,
        monitor: Arc<dyn Monitor>,
    ) -> Self {
        Self {
            serialization,
            handlers,
            backoff,
            monitor,
            on_error: None,
            unhandled: UnhandledPolicy::default(),
        }
    }

    /// Set the callback invoked once per nacked dispatch.
    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn with_unhandled_policy(mut self, policy: UnhandledPolicy) -> Self {
        self.unhandled = policy;
        self
    }

    /// Dispatch one raw message. Always completes with a terminal outcome;
    /// transport and handler failures are absorbed into it.
    pub async fn dispatch(
        &self,
        transport: &dyn QueueTransport,
        raw: RawMessage,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let raw = Arc::new(raw);
        let attempt = raw.receive_count.max(1);

        if cancel.is_cancelled() {
            return DispatchOutcome::Cancelled;
        }

        // Decode. A payload that fails to decode will fail identically on
        // every redelivery, so back off hard rather than retry hot.
        let decoded = match raw.subject.as_deref() {
            Some(subject) => self
                .serialization
                .decode(subject, &raw.body)
                .map(|message| (subject.to_string(), message)),
            None => Err(SerializationError::MissingSubject),
        };

        let (subject, message) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                let delay = self.backoff.decode_failure_duration(attempt);
                let cause = DispatchError::Serialization(e);
                error!(
                    queue = %raw.queue,
                    message_id = %raw.message_id,
                    subject = ?raw.subject,
                    error = %cause,
                    "Failed to decode message"
                );
                self.nack(transport, &raw, delay, Some(&cause)).await;
                self.monitor.handle_failed(
                    raw.subject.as_deref(),
                    &raw.queue,
                    started.elapsed(),
                    Some(&cause),
                );
                return DispatchOutcome::Nacked;
            }
        };

        // Resolve handlers.
        let handlers = self.handlers.resolve(message.as_any().type_id());
        if handlers.is_empty() {
            return match self.unhandled {
                UnhandledPolicy::Ack => {
                    warn!(
                        subject = %subject,
                        queue = %raw.queue,
                        "No handler registered, acknowledging per policy"
                    );
                    self.ack(transport, &raw).await;
                    self.monitor.handled(&subject, &raw.queue, started.elapsed());
                    DispatchOutcome::Acked
                }
                UnhandledPolicy::Nack => {
                    let cause = DispatchError::NoHandler {
                        subject: subject.clone(),
                    };
                    warn!(subject = %subject, queue = %raw.queue, "No handler registered, nacking");
                    let delay = self.backoff.backoff_duration(message.as_ref(), attempt, None);
                    self.nack(transport, &raw, delay, Some(&cause)).await;
                    self.monitor.handle_failed(
                        Some(&subject),
                        &raw.queue,
                        started.elapsed(),
                        Some(&cause),
                    );
                    DispatchOutcome::Nacked
                }
            };
        }

        // Invoke every handler in registration order with the ambient
        // context set. The scope clears the context on every exit path.
        let dispatch_context = MessageContext::new(Arc::clone(&raw));
        let invocation = context::scope(dispatch_context, async {
            let mut any_failed = false;
            let mut first_error: Option<HandlerError> = None;

            for handler in handlers {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Invocation::Cancelled,
                    result = handler(Arc::clone(&message)) => result,
                };
                match result {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(subject = %subject, queue = %raw.queue, "Handler reported failure");
                        any_failed = true;
                    }
                    Err(e) => {
                        error!(
                            subject = %subject,
                            queue = %raw.queue,
                            error = %e,
                            "Handler failed"
                        );
                        any_failed = true;
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }

            if any_failed {
                Invocation::Failed(first_error)
            } else {
                Invocation::Success
            }
        })
        .await;

        match invocation {
            Invocation::Cancelled => {
                debug!(
                    subject = %subject,
                    queue = %raw.queue,
                    "Dispatch cancelled, message left for redelivery"
                );
                DispatchOutcome::Cancelled
            }
            Invocation::Success => {
                self.ack(transport, &raw).await;
                self.monitor.handled(&subject, &raw.queue, started.elapsed());
                DispatchOutcome::Acked
            }
            Invocation::Failed(handler_error) => {
                let delay =
                    self.backoff
                        .backoff_duration(message.as_ref(), attempt, handler_error.as_ref());
                let cause = handler_error.map(DispatchError::Handler);
                self.nack(transport, &raw, delay, cause.as_ref()).await;
                self.monitor.handle_failed(
                    Some(&subject),
                    &raw.queue,
                    started.elapsed(),
                    cause.as_ref(),
                );
                DispatchOutcome::Nacked
            }
        }
    }

    async fn ack(&self, transport: &dyn QueueTransport, raw: &RawMessage) {
        if let Err(e) = transport.delete(raw).await {
            error!(
                queue = %raw.queue,
                message_id = %raw.message_id,
                error = %e,
                "Failed to delete acknowledged message"
            );
        }
    }

    async fn nack(
        &self,
        transport: &dyn QueueTransport,
        raw: &RawMessage,
        delay: Duration,
        cause: Option<&DispatchError>,
    ) {
        if let Err(e) = transport.change_visibility(raw, delay).await {
            error!(
                queue = %raw.queue,
                message_id = %raw.message_id,
                error = %e,
                "Failed to update visibility for failed message"
            );
        }
        if let Some(callback) = &self.on_error {
            callback(cause, raw);
        }
    }
}
