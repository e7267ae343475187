//! Workflow identity and generated identifiers.
//!
//! A [`WorkflowId`] names a workflow; a [`WorkflowInstance`] names one
//! schedule partition of it. Instances are the keys of the event log and the
//! active-instance index, so equality and hashing are structural.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The synthetic trigger id carried by legacy `timeTrigger` events.
pub const NATURAL_TRIGGER_LEGACY_ID: &str = "natural-trigger";

/// Identifies a workflow: a component (the owning system or pipeline) plus a
/// workflow name unique within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowId {
    /// The owning component.
    pub component: String,
    /// The workflow name within the component.
    pub name: String,
}

impl WorkflowId {
    /// Creates a new workflow id.
    #[must_use]
    pub fn new(component: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.component, self.name)
    }
}

/// One schedule partition of a workflow.
///
/// The parameter is the canonical textual rendering of the partition instant
/// for the workflow's schedule (e.g. `2017-01-02` for a daily workflow,
/// `2017-01-02T03` for an hourly one). Two instances are equal iff workflow id
/// and parameter are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    /// The workflow this instance belongs to.
    pub workflow_id: WorkflowId,
    /// The partition parameter.
    pub parameter: String,
}

impl WorkflowInstance {
    /// Creates a new workflow instance.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, parameter: impl Into<String>) -> Self {
        Self {
            workflow_id,
            parameter: parameter.into(),
        }
    }
}

impl fmt::Display for WorkflowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.workflow_id, self.parameter)
    }
}

/// Generates a globally unique trigger id for a natural trigger.
#[must_use]
pub fn natural_trigger_id() -> String {
    format!("natural-{}", random_suffix())
}

/// Generates a globally unique backfill id.
#[must_use]
pub fn backfill_id() -> String {
    format!("backfill-{}", random_suffix())
}

/// Generates a globally unique container execution id.
#[must_use]
pub fn execution_id() -> String {
    format!("almanac-run-{}", random_suffix())
}

fn random_suffix() -> String {
    Ulid::new().to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_equality_is_structural() {
        let a = WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2017-01-02");
        let b = WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2017-01-02");
        let c = WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2017-01-03");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn display_renders_component_name_parameter() {
        let instance = WorkflowInstance::new(WorkflowId::new("etl", "hourly"), "2017-01-02T03");
        assert_eq!(instance.to_string(), "etl#hourly#2017-01-02T03");
    }

    #[test]
    fn generated_ids_carry_their_prefix_and_differ() {
        let a = natural_trigger_id();
        let b = natural_trigger_id();
        assert!(a.starts_with("natural-"));
        assert_ne!(a, b);
        assert!(backfill_id().starts_with("backfill-"));
        assert!(execution_id().starts_with("almanac-run-"));
    }
}
