//! Minimum spacing between API requests, shared by a task and its sub-tasks

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Shared "last request" timestamp.
///
/// Every task that should be spaced together holds the same `Arc<RateLimiter>`.
/// A reservation advances the timestamp immediately, so two callers racing for
/// the next slot are spaced relative to each other rather than both firing.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next slot and return how long the caller must wait for it
    pub fn reserve(&self, interval: Duration) -> Duration {
        let now = Instant::now();
        let mut last = self.last_call.lock();
        let delay = match *last {
            Some(prev) => (prev + interval).saturating_duration_since(now),
            None => Duration::ZERO,
        };
        *last = Some(now + delay);
        delay
    }

    /// Wait for the next slot, or fail with [`Error::Aborted`] if cancelled first.
    /// Returns the delay that was applied.
    pub async fn wait(&self, interval: Duration, cancel: &CancellationToken) -> Result<Duration> {
        let delay = self.reserve(interval);
        if delay.is_zero() {
            return Ok(delay);
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "rate limiting API request");
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Aborted),
            _ = tokio::time::sleep(delay) => Ok(delay),
        }
    }

    /// Forget the last call, for example when starting a fresh session
    pub fn reset(&self) {
        *self.last_call.lock() = None;
    }
}
