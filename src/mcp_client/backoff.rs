// ABOUTME: Exponential backoff schedule for connection retries
//
// Produces min(base * 2^attempt, max) per call: with a 1s base the
// sequence is 1s, 2s, 4s, ...

use std::time::Duration;

use super::config::RetryPolicy;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a schedule starting at `base`, capped at `max`
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current_attempt: 0,
        }
    }

    /// Schedule described by a retry policy
    #[must_use]
    pub const fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.base_delay, policy.max_delay)
    }

    /// Next delay; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u64.saturating_pow(self.current_attempt);
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));

        self.current_attempt = self.current_attempt.saturating_add(1);

        std::cmp::min(delay, self.max)
    }

    /// Restart the schedule
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Delays handed out so far
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}
