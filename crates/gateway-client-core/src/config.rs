//! Session configuration.

use std::time::Duration;

/// Tuning knobs for a session.
///
/// All values have documented defaults; embedders override what they need.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How long a request waits for a correlated reply. Default 5 s.
    pub request_timeout: Duration,
    /// Idle interval after which a keepalive is sent. Default 50 s.
    pub keepalive_interval: Duration,
    /// Grace period a detached handle stays routable, absorbing late
    /// in-flight pushes. Default 30 s.
    pub detach_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(50),
            detach_grace: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Override the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the keepalive interval.
    #[must_use]
    pub const fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Override the detach grace period.
    #[must_use]
    pub const fn with_detach_grace(mut self, grace: Duration) -> Self {
        self.detach_grace = grace;
        self
    }
}
