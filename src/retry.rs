//! Reconnect and timeout utilities.
//!
//! The stream reconnects on a fixed delay with no growth and no attempt cap.
//! The helpers here are transport-agnostic so the connection worker and its
//! tests can share them.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Policy controlling the delay between a close and the next connect attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay applied after every close, regardless of its cause.
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Delay used when no explicit policy is configured.
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(2000);

    /// Returns a policy that always waits `delay` before reconnecting.
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Waits out the reconnect delay that follows close number `attempt`.
    ///
    /// The delay is the same for every attempt. Returns early when `wake` is
    /// notified or `cancel` fires; cancellation wins if both are ready.
    pub async fn wait(
        &self,
        attempt: u64,
        wake: &Notify,
        cancel: &CancellationToken,
    ) -> ReconnectWait {
        debug!(
            event = "reconnect_scheduled",
            attempt,
            delay_ms = self.delay.as_millis() as u64
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => ReconnectWait::Cancelled,
            _ = wake.notified() => ReconnectWait::Woken,
            _ = tokio::time::sleep(self.delay) => ReconnectWait::Elapsed,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Self::DEFAULT_DELAY)
    }
}

/// How a reconnect wait ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectWait {
    /// The full delay elapsed.
    Elapsed,
    /// A caller asked for an immediate attempt.
    Woken,
    /// The owning manager was stopped.
    Cancelled,
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
