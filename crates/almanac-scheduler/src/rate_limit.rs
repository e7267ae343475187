//! Global submission rate limiting.
//!
//! Container submissions across the whole process go through one token
//! bucket. The configured rate lives in storage and is re-read periodically
//! by the runtime; [`SubmissionRateLimiter::set_rate`] swaps the bucket when
//! it changes. Acquisition blocks the calling handler task, never a
//! state-manager shard.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::RwLock;
use tracing::info;

/// Default global submission rate, in container starts per second.
pub const DEFAULT_SUBMISSION_RATE_PER_SEC: f64 = 1000.0;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Process-wide token bucket gating container starts.
#[derive(Debug)]
pub struct SubmissionRateLimiter {
    state: RwLock<LimiterState>,
}

struct LimiterState {
    rate: f64,
    limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for LimiterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterState").field("rate", &self.rate).finish()
    }
}

impl SubmissionRateLimiter {
    /// Creates a limiter with the given rate in permits per second.
    #[must_use]
    pub fn new(permits_per_sec: f64) -> Self {
        Self {
            state: RwLock::new(LimiterState {
                rate: permits_per_sec,
                limiter: build_limiter(permits_per_sec),
            }),
        }
    }

    /// Waits until a submission token is available.
    pub async fn acquire(&self) {
        let limiter = Arc::clone(&self.state.read().await.limiter);
        limiter.until_ready().await;
    }

    /// Returns the currently configured rate.
    pub async fn rate(&self) -> f64 {
        self.state.read().await.rate
    }

    /// Replaces the token bucket if the configured rate changed.
    ///
    /// Tokens accumulated under the old rate are discarded; callers mid
    /// `acquire` finish against the old bucket.
    pub async fn set_rate(&self, permits_per_sec: f64) {
        let mut state = self.state.write().await;
        if (state.rate - permits_per_sec).abs() < f64::EPSILON {
            return;
        }
        info!(
            from = state.rate,
            to = permits_per_sec,
            "updating submission rate limit"
        );
        state.rate = permits_per_sec;
        state.limiter = build_limiter(permits_per_sec);
    }
}

impl Default for SubmissionRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_SUBMISSION_RATE_PER_SEC)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn build_limiter(permits_per_sec: f64) -> Arc<DirectLimiter> {
    let permits =
        NonZeroU32::new(permits_per_sec.max(1.0) as u32).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(permits)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_is_immediate_within_the_burst() {
        let limiter = SubmissionRateLimiter::new(1000.0);
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
            .await
            .expect("first token should be immediate");
    }

    #[tokio::test]
    async fn set_rate_replaces_the_bucket_only_on_change() {
        let limiter = SubmissionRateLimiter::new(10.0);
        assert!((limiter.rate().await - 10.0).abs() < f64::EPSILON);

        limiter.set_rate(10.0).await;
        assert!((limiter.rate().await - 10.0).abs() < f64::EPSILON);

        limiter.set_rate(250.0).await;
        assert!((limiter.rate().await - 250.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sub_one_rates_are_clamped_to_one_permit() {
        let limiter = SubmissionRateLimiter::new(0.25);
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
            .await
            .expect("clamped limiter should still issue a token");
    }
}
