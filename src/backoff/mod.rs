//! Backoff strategies for failed message handling.
//!
//! A [`BackoffStrategy`] computes the next invisibility window for a
//! message that was not acknowledged: a pure function of the typed
//! message, the transport-reported delivery attempt, and the handler
//! error (absent when the handler reported failure without one). The
//! returned duration keeps the message hidden from other consumers until
//! the next attempt.

use std::time::Duration;

use crate::handlers::HandlerError;
use crate::serialization::Message;

/// Doubling curve from `initial`, capped at `max`. Attempt is 1-based.
fn doubling(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.max(1).saturating_sub(1).min(16);
    initial.saturating_mul(1u32 << exponent).min(max)
}

/// Computes the delay before a failed message becomes visible again.
///
/// `attempt` comes from the transport's own delivery counter
/// ([`crate::transport::RawMessage::receive_count`]); the bus never tracks
/// attempts itself. Implementations may vary the curve by message type or
/// error.
pub trait BackoffStrategy: Send + Sync {
    /// Delay before redelivery after a handler failure on `attempt`.
    fn backoff_duration(
        &self,
        message: &dyn Message,
        attempt: u32,
        error: Option<&HandlerError>,
    ) -> Duration;

    /// Delay before redelivery for a message that could not be decoded.
    ///
    /// No typed message exists on this path. The payload will not change
    /// between deliveries, so the default curve backs off hard.
    fn decode_failure_duration(&self, attempt: u32) -> Duration {
        doubling(Duration::from_secs(30), Duration::from_secs(300), attempt)
    }
}

/// Exponential backoff: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct DefaultBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for DefaultBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(900),
        }
    }
}

impl DefaultBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }
}

impl BackoffStrategy for DefaultBackoff {
    fn backoff_duration(
        &self,
        _message: &dyn Message,
        attempt: u32,
        _error: Option<&HandlerError>,
    ) -> Duration {
        doubling(self.initial, self.max, attempt)
    }
}

/// Constant backoff: every failure waits the same window.
#[derive(Debug, Clone)]
pub struct FixedBackoff(pub Duration);

impl BackoffStrategy for FixedBackoff {
    fn backoff_duration(
        &self,
        _message: &dyn Message,
        _attempt: u32,
        _error: Option<&HandlerError>,
    ) -> Duration {
        self.0
    }

    fn decode_failure_duration(&self, _attempt: u32) -> Duration {
        self.0
    }
}
