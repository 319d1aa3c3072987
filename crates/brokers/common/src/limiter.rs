use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::time::Duration;

/// Enforces a minimum spacing between outgoing venue commands.
///
/// A zero spacing disables throttling.
pub struct CommandLimiter {
    inner: Option<DefaultDirectRateLimiter>,
}

impl CommandLimiter {
    pub fn with_spacing(spacing: Duration) -> Self {
        Self {
            inner: Quota::with_period(spacing).map(RateLimiter::direct),
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.inner.is_some()
    }

    /// Wait until the next command may be sent.
    pub async fn until_ready(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}
