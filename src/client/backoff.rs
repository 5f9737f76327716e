//! Reconnect backoff

use std::time::Duration;

/// Exponential reconnect delay: doubles per failure, resets on success
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            current: base_delay,
        }
    }

    /// Delay to wait now, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max_delay);
        delay
    }

    /// Back to the base delay after a successful handshake
    pub const fn reset(&mut self) {
        self.current = self.base_delay;
    }
}
