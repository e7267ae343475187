//! Publishes run outcomes to an external pub/sub system.

use std::sync::Arc;

use async_trait::async_trait;

use almanac_core::{RunState, State};

use crate::error::Result;
use crate::handlers::OutputHandler;

/// Substitutable contract for the external pub/sub sink.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Notifies that a run reached an outcome state.
    async fn instance_finished(&self, state: &RunState) -> Result<()>;
}

/// A publisher that drops everything. The development-mode default.
#[derive(Debug, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn instance_finished(&self, _state: &RunState) -> Result<()> {
        Ok(())
    }
}

/// Emits a domain event on `DONE` and `FAILED`.
pub struct PublisherHandler {
    publisher: Arc<dyn Publisher>,
}

impl PublisherHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl OutputHandler for PublisherHandler {
    fn name(&self) -> &'static str {
        "publisher"
    }

    async fn transition_into(&self, state: &RunState) -> Result<()> {
        if matches!(state.state, State::Done | State::Failed) {
            self.publisher.instance_finished(state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use almanac_core::{Event, WorkflowId, WorkflowInstance};
    use chrono::Utc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        finished: Mutex<Vec<State>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn instance_finished(&self, state: &RunState) -> Result<()> {
            self.finished.lock().await.push(state.state);
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_done_but_not_intermediate_states() {
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = PublisherHandler::new(Arc::clone(&publisher) as _);

        let instance = WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2020-01-01");
        let now = Utc::now();
        let queued = RunState::fresh(instance, 0, now)
            .transition(
                &Event::TriggerExecution {
                    trigger_id: "t".into(),
                    parameters: almanac_core::state::TriggerParameters::default(),
                },
                now,
            )
            .unwrap();
        handler.transition_into(&queued).await.unwrap();
        assert!(publisher.finished.lock().await.is_empty());

        let done = queued.transition(&Event::Halt, now).unwrap();
        handler.transition_into(&done).await.unwrap();
        assert_eq!(&publisher.finished.lock().await[..], [State::Done]);
    }
}
