//! Output handlers: side-effecting reactions to state entry.
//!
//! After a transition is durably logged, the state manager fans the new
//! [`RunState`] out to an ordered chain of handlers. A handler failure is
//! logged and metered but never prevents subsequent handlers from running
//! and never reverses the transition; the event is already in the log.
//!
//! Handlers post follow-up events back through [`EventSink`]
//! (`crate::state_manager::EventSink`); they never mutate state directly.

mod docker;
mod execution;
mod publisher;
mod termination;

pub use docker::DockerRunnerHandler;
pub use execution::ExecutionDescriptionHandler;
pub use publisher::{NoopPublisher, Publisher, PublisherHandler};
pub use termination::TerminationHandler;

use async_trait::async_trait;
use tracing::info;

use almanac_core::RunState;

use crate::error::Result;
use crate::metrics::{labels, names};

/// A side-effecting reaction to entering a state.
#[async_trait]
pub trait OutputHandler: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Reacts to the instance having entered `state`.
    async fn transition_into(&self, state: &RunState) -> Result<()>;
}

/// Emits one structured log line per state transition.
#[derive(Debug, Default)]
pub struct TransitionLogger;

#[async_trait]
impl OutputHandler for TransitionLogger {
    fn name(&self) -> &'static str {
        "transition-logger"
    }

    async fn transition_into(&self, state: &RunState) -> Result<()> {
        info!(
            instance = %state.instance,
            state = %state.state,
            counter = state.counter,
            trigger_id = state.data.trigger_id.as_deref().unwrap_or("-"),
            execution_id = state.data.execution_id.as_deref().unwrap_or("-"),
            "state transition"
        );
        Ok(())
    }
}

/// Updates transition counters.
#[derive(Debug, Default)]
pub struct MonitoringHandler;

#[async_trait]
impl OutputHandler for MonitoringHandler {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    async fn transition_into(&self, state: &RunState) -> Result<()> {
        metrics::counter!(
            names::TRANSITIONS_TOTAL,
            labels::STATE => state.state.as_label()
        )
        .increment(1);
        Ok(())
    }
}
