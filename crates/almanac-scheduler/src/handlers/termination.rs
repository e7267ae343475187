//! Schedules retries for terminated and failed runs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use almanac_core::retry::RetryPolicy;
use almanac_core::state::UNRECOVERABLE_FAILURE_EXIT_CODE;
use almanac_core::{Event, RunState, State};

use crate::error::Result;
use crate::handlers::OutputHandler;
use crate::state_manager::EventSink;

/// Default maximum number of retries before a run is stopped.
pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// On `TERMINATED` and `FAILED`, posts `retryAfter` with an exponential
/// backoff delay, or `stop` when retries are exhausted or the exit code is
/// unrecoverable.
pub struct TerminationHandler {
    policy: RetryPolicy,
    max_retries: u32,
    sink: Arc<dyn EventSink>,
}

impl TerminationHandler {
    /// Creates the handler with the default retry budget.
    #[must_use]
    pub fn new(policy: RetryPolicy, sink: Arc<dyn EventSink>) -> Self {
        Self::with_max_retries(policy, DEFAULT_MAX_RETRIES, sink)
    }

    /// Creates the handler with a custom retry budget.
    #[must_use]
    pub fn with_max_retries(policy: RetryPolicy, max_retries: u32, sink: Arc<dyn EventSink>) -> Self {
        Self {
            policy,
            max_retries,
            sink,
        }
    }
}

#[async_trait]
impl OutputHandler for TerminationHandler {
    fn name(&self) -> &'static str {
        "termination"
    }

    async fn transition_into(&self, state: &RunState) -> Result<()> {
        if !matches!(state.state, State::Terminated | State::Failed) {
            return Ok(());
        }

        let unrecoverable = state.data.last_exit == Some(UNRECOVERABLE_FAILURE_EXIT_CODE);
        if unrecoverable || state.data.retry_cost >= self.max_retries {
            info!(
                instance = %state.instance,
                retry_cost = state.data.retry_cost,
                last_exit = ?state.data.last_exit,
                "stopping run",
            );
            return self.sink.receive(&state.instance, Event::Stop).await;
        }

        let delay = self.policy.delay(state.data.retry_cost);
        #[allow(clippy::cast_possible_wrap)]
        let delay_millis = delay.as_millis() as i64;
        self.sink
            .receive(&state.instance, Event::RetryAfter { delay_millis })
            .await
    }
}
