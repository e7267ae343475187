//! Retry backoff policy.

use std::time::Duration;

/// Exponential retry backoff: `base_delay * 2^min(retry_cost, max_exponent)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Exponent ceiling for the doubling.
    pub max_exponent: u32,
    /// Absolute delay ceiling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3 * 60),
            max_exponent: 4,
            max_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Computes the backoff delay for the given retry cost.
    #[must_use]
    pub fn delay(&self, retry_cost: u32) -> Duration {
        let exponent = retry_cost.min(self.max_exponent);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}
