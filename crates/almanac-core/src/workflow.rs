//! Workflow definitions.

use serde::{Deserialize, Serialize};

use crate::id::WorkflowId;
use crate::schedule::Schedule;

/// A workflow: an identity, a schedule partitioning, and the configuration
/// needed to execute one partition in a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// The workflow identity.
    pub id: WorkflowId,
    /// The schedule partitioning.
    pub schedule: Schedule,
    /// Container execution configuration.
    pub configuration: WorkflowConfiguration,
}

impl Workflow {
    /// Creates a new workflow.
    #[must_use]
    pub fn new(id: WorkflowId, schedule: Schedule, configuration: WorkflowConfiguration) -> Self {
        Self {
            id,
            schedule,
            configuration,
        }
    }

    /// Returns true iff the workflow has enough configuration to run.
    ///
    /// A workflow is configured iff a docker image is present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.configuration.docker_image.is_some()
    }
}

/// Container execution configuration for a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfiguration {
    /// The container image to run. Absent for workflows that are registered
    /// but not yet runnable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    /// Arguments passed to the container command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docker_args: Vec<String>,
    /// Resource requirements for the container.
    #[serde(default, skip_serializing_if = "ResourceRequest::is_empty")]
    pub resources: ResourceRequest,
}

/// Resource requirements for a container execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    /// Requested CPU in millicores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u32>,
    /// Requested memory in mebibytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u32>,
}

impl ResourceRequest {
    /// Returns true iff no resources are requested.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cpu_millis.is_none() && self.memory_mib.is_none()
    }
}
