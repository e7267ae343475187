//! The container runner contract.
//!
//! The engine talks to the container runtime only through [`DockerRunner`].
//! The production adapter (a Kubernetes-backed runner) lives outside this
//! crate; [`LocalDockerRunner`] backs development mode and end-to-end tests
//! by simulating container lifecycles through the event sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use almanac_core::{Event, WorkflowInstance};

use crate::error::Result;
use crate::state_manager::EventSink;

/// The resolved specification of one container execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    /// Unique execution id; also used for deduplication by the runner.
    pub execution_id: String,
    /// Container image.
    pub docker_image: String,
    /// Container arguments.
    pub docker_args: Vec<String>,
}

/// Substitutable contract for the container runtime adapter.
///
/// `start` must be idempotent on `execution_id`: resubmitting the same spec
/// must not start a second container. Started executions are authoritative
/// on the runner side; the engine reconciles through replay after a restart
/// rather than cancelling in-flight calls.
#[async_trait]
pub trait DockerRunner: Send + Sync {
    /// Starts a container for the instance, returning the execution id.
    async fn start(&self, instance: &WorkflowInstance, spec: &RunSpec) -> Result<String>;

    /// Releases runner-side resources of a finished execution.
    async fn cleanup(&self, execution_id: &str) -> Result<()>;
}

/// Development-mode runner that simulates container lifecycles.
///
/// Every started execution posts `started` and then `terminate(0)` back
/// through the event sink after short delays, so a locally running scheduler
/// exercises the full state machine without a container runtime.
pub struct LocalDockerRunner {
    sink: Arc<dyn EventSink>,
    startup_delay: Duration,
    run_duration: Duration,
    executions: Mutex<Vec<String>>,
}

impl LocalDockerRunner {
    /// Creates a local runner with sub-second simulated lifecycles.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_delays(sink, Duration::from_millis(100), Duration::from_millis(500))
    }

    /// Creates a local runner with explicit delays.
    #[must_use]
    pub fn with_delays(
        sink: Arc<dyn EventSink>,
        startup_delay: Duration,
        run_duration: Duration,
    ) -> Self {
        Self {
            sink,
            startup_delay,
            run_duration,
            executions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DockerRunner for LocalDockerRunner {
    async fn start(&self, instance: &WorkflowInstance, spec: &RunSpec) -> Result<String> {
        {
            let mut executions = self.executions.lock().await;
            if executions.contains(&spec.execution_id) {
                debug!(execution_id = %spec.execution_id, "duplicate start, ignoring");
                return Ok(spec.execution_id.clone());
            }
            executions.push(spec.execution_id.clone());
        }

        info!(
            instance = %instance,
            execution_id = %spec.execution_id,
            image = %spec.docker_image,
            "starting simulated container"
        );

        let sink = Arc::clone(&self.sink);
        let instance = instance.clone();
        let startup_delay = self.startup_delay;
        let run_duration = self.run_duration;
        tokio::spawn(async move {
            tokio::time::sleep(startup_delay).await;
            if let Err(error) = sink.receive(&instance, Event::Started).await {
                warn!(instance = %instance, error = %error, "failed to post started");
                return;
            }
            tokio::time::sleep(run_duration).await;
            if let Err(error) = sink
                .receive(&instance, Event::Terminate { exit_code: 0 })
                .await
            {
                warn!(instance = %instance, error = %error, "failed to post terminate");
            }
        });

        Ok(spec.execution_id.clone())
    }

    async fn cleanup(&self, execution_id: &str) -> Result<()> {
        debug!(execution_id, "cleaning up simulated container");
        self.executions
            .lock()
            .await
            .retain(|id| id != execution_id);
        Ok(())
    }
}
