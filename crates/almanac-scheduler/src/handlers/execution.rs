//! Resolves workflow configuration into an execution description.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use almanac_core::state::ExecutionDescription;
use almanac_core::{Event, RunState, State};

use crate::error::Result;
use crate::handlers::OutputHandler;
use crate::state_manager::EventSink;
use crate::storage::Storage;

/// On `PREPARE`, looks up the workflow and emits `submit` with the resolved
/// execution description. An unconfigured or missing workflow halts the
/// instance; a storage failure becomes a `runError` so the retry machinery
/// applies.
pub struct ExecutionDescriptionHandler {
    storage: Arc<dyn Storage>,
    sink: Arc<dyn EventSink>,
}

impl ExecutionDescriptionHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, sink: Arc<dyn EventSink>) -> Self {
        Self { storage, sink }
    }
}

#[async_trait]
impl OutputHandler for ExecutionDescriptionHandler {
    fn name(&self) -> &'static str {
        "execution-description"
    }

    async fn transition_into(&self, state: &RunState) -> Result<()> {
        if state.state != State::Prepare {
            return Ok(());
        }

        let workflow = match self.storage.workflow(&state.instance.workflow_id).await {
            Ok(workflow) => workflow,
            Err(error) => {
                return self
                    .sink
                    .receive(
                        &state.instance,
                        Event::RunError {
                            message: format!("failed to read workflow: {error}"),
                        },
                    )
                    .await;
            }
        };

        let Some(workflow) = workflow else {
            warn!(instance = %state.instance, "workflow not found, halting instance");
            return self.sink.receive(&state.instance, Event::Halt).await;
        };
        let Some(docker_image) = workflow.configuration.docker_image.clone() else {
            warn!(instance = %state.instance, "workflow has no docker image, halting instance");
            return self.sink.receive(&state.instance, Event::Halt).await;
        };

        self.sink
            .receive(
                &state.instance,
                Event::Submit {
                    description: ExecutionDescription {
                        docker_image,
                        docker_args: workflow.configuration.docker_args.clone(),
                    },
                },
            )
            .await
    }
}
