//! Submits executions to the container runner.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use almanac_core::id::execution_id;
use almanac_core::{Event, RunState, State};

use crate::error::Result;
use crate::handlers::OutputHandler;
use crate::metrics::{labels, names};
use crate::rate_limit::SubmissionRateLimiter;
use crate::runner::{DockerRunner, RunSpec};
use crate::state_manager::EventSink;

/// On `SUBMITTING`, acquires a global submission token and starts the
/// container; success posts `submitted`, failure posts `runError`. On the
/// terminated, failed and terminal states, cleans up the execution.
///
/// Token acquisition blocks this handler's task, never a state-manager
/// shard.
pub struct DockerRunnerHandler {
    runner: Arc<dyn DockerRunner>,
    sink: Arc<dyn EventSink>,
    rate_limiter: Arc<SubmissionRateLimiter>,
}

impl DockerRunnerHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(
        runner: Arc<dyn DockerRunner>,
        sink: Arc<dyn EventSink>,
        rate_limiter: Arc<SubmissionRateLimiter>,
    ) -> Self {
        Self {
            runner,
            sink,
            rate_limiter,
        }
    }

    async fn submit(&self, state: &RunState) -> Result<()> {
        let Some(description) = state.data.execution_description.clone() else {
            return self
                .sink
                .receive(
                    &state.instance,
                    Event::RunError {
                        message: "missing execution description".into(),
                    },
                )
                .await;
        };

        self.rate_limiter.acquire().await;

        let spec = RunSpec {
            execution_id: execution_id(),
            docker_image: description.docker_image,
            docker_args: description.docker_args,
        };
        match self.runner.start(&state.instance, &spec).await {
            Ok(execution_id) => {
                metrics::counter!(names::SUBMISSIONS_TOTAL, labels::RESULT => "submitted")
                    .increment(1);
                self.sink
                    .receive(&state.instance, Event::Submitted { execution_id })
                    .await
            }
            Err(error) => {
                metrics::counter!(names::SUBMISSIONS_TOTAL, labels::RESULT => "failed")
                    .increment(1);
                warn!(instance = %state.instance, error = %error, "runner start failed");
                self.sink
                    .receive(
                        &state.instance,
                        Event::RunError {
                            message: format!("runner start failed: {error}"),
                        },
                    )
                    .await
            }
        }
    }

    async fn cleanup(&self, state: &RunState) -> Result<()> {
        if let Some(execution_id) = state.data.execution_id.as_deref() {
            if let Err(error) = self.runner.cleanup(execution_id).await {
                warn!(
                    instance = %state.instance,
                    execution_id,
                    error = %error,
                    "runner cleanup failed"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OutputHandler for DockerRunnerHandler {
    fn name(&self) -> &'static str {
        "docker-runner"
    }

    async fn transition_into(&self, state: &RunState) -> Result<()> {
        match state.state {
            State::Submitting => self.submit(state).await,
            State::Terminated | State::Failed | State::Done | State::Error => {
                self.cleanup(state).await
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use almanac_core::state::{ExecutionDescription, TriggerParameters};
    use almanac_core::{WorkflowId, WorkflowInstance};
    use chrono::Utc;
    use tokio::sync::Mutex;

    use crate::error::Error;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn receive(&self, _instance: &WorkflowInstance, event: Event) -> Result<()> {
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRunner {
        started: Mutex<Vec<RunSpec>>,
        cleaned: Mutex<Vec<String>>,
        fail_start: bool,
    }

    #[async_trait]
    impl DockerRunner for RecordingRunner {
        async fn start(
            &self,
            _instance: &WorkflowInstance,
            spec: &RunSpec,
        ) -> Result<String> {
            if self.fail_start {
                return Err(Error::runner("image pull backoff"));
            }
            self.started.lock().await.push(spec.clone());
            Ok(spec.execution_id.clone())
        }

        async fn cleanup(&self, execution_id: &str) -> Result<()> {
            self.cleaned.lock().await.push(execution_id.to_string());
            Ok(())
        }
    }

    fn submitting_state() -> RunState {
        let instance = WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2020-01-01");
        let now = Utc::now();
        RunState::fresh(instance, 0, now)
            .transition(
                &Event::TriggerExecution {
                    trigger_id: "t".into(),
                    parameters: TriggerParameters::default(),
                },
                now,
            )
            .unwrap()
            .transition(&Event::Dequeue, now)
            .unwrap()
            .transition(
                &Event::Submit {
                    description: ExecutionDescription {
                        docker_image: "busybox:1".into(),
                        docker_args: vec!["--date".into()],
                    },
                },
                now,
            )
            .unwrap()
    }

    fn handler(
        runner: Arc<RecordingRunner>,
        sink: Arc<RecordingSink>,
    ) -> DockerRunnerHandler {
        DockerRunnerHandler::new(
            runner,
            sink,
            Arc::new(SubmissionRateLimiter::new(1000.0)),
        )
    }

    #[tokio::test]
    async fn submitting_starts_the_container_and_posts_submitted() {
        let runner = Arc::new(RecordingRunner::default());
        let sink = Arc::new(RecordingSink::default());
        let handler = handler(Arc::clone(&runner), Arc::clone(&sink));

        handler.transition_into(&submitting_state()).await.unwrap();

        let started = runner.started.lock().await;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].docker_image, "busybox:1");
        assert!(started[0].execution_id.starts_with("almanac-run-"));

        let events = sink.events.lock().await;
        assert!(matches!(&events[..], [Event::Submitted { .. }]));
    }

    #[tokio::test]
    async fn runner_failure_posts_run_error() {
        let runner = Arc::new(RecordingRunner {
            fail_start: true,
            ..RecordingRunner::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let handler = handler(runner, Arc::clone(&sink));

        handler.transition_into(&submitting_state()).await.unwrap();

        let events = sink.events.lock().await;
        assert!(matches!(
            &events[..],
            [Event::RunError { message }] if message.contains("image pull backoff")
        ));
    }

    #[tokio::test]
    async fn terminal_states_clean_up_the_execution() {
        let runner = Arc::new(RecordingRunner::default());
        let sink = Arc::new(RecordingSink::default());
        let handler = handler(Arc::clone(&runner), sink);

        let now = Utc::now();
        let done = submitting_state()
            .transition(
                &Event::Submitted {
                    execution_id: "almanac-run-7".into(),
                },
                now,
            )
            .unwrap()
            .transition(&Event::Started, now)
            .unwrap()
            .transition(&Event::Terminate { exit_code: 0 }, now)
            .unwrap();

        handler.transition_into(&done).await.unwrap();

        assert_eq!(&runner.cleaned.lock().await[..], ["almanac-run-7"]);
    }
}
