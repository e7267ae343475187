//! Wire payloads of the management surface.
//!
//! Field names are camelCase and timestamps are RFC 3339, matching the rest
//! of the event and backfill wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use almanac_core::state::{StateData, TriggerParameters};
use almanac_core::{Backfill, SequencedEvent, WorkflowInstance};
use almanac_scheduler::backfill::RunStateSummary;

/// Request body for `POST /backfills`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillInput {
    /// The owning component.
    pub component: String,
    /// The workflow name within the component.
    pub workflow: String,
    /// Start of the partition range (inclusive, RFC 3339).
    pub start: DateTime<Utc>,
    /// End of the partition range (exclusive, RFC 3339).
    pub end: DateTime<Utc>,
    /// Maximum simultaneously active instances.
    pub concurrency: u32,
    /// Operator-facing description.
    #[serde(default)]
    pub description: Option<String>,
    /// Trigger partitions newest-first.
    #[serde(default)]
    pub reverse: bool,
    /// Parameters passed to every triggered instance.
    #[serde(default)]
    pub trigger_parameters: Option<TriggerParameters>,
}

/// Request body for `PUT /backfills/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditableBackfillInput {
    /// Backfill id; must match the id in the URI.
    pub id: String,
    /// New concurrency cap.
    #[serde(default)]
    pub concurrency: Option<u32>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
}

/// One instance's status row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStateData {
    /// The partition instance.
    pub workflow_instance: WorkflowInstance,
    /// State name; a machine state, `WAITING` or `UNKNOWN`.
    pub state: String,
    /// State payload.
    pub state_data: StateData,
    /// When the state was entered, where known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_timestamp: Option<DateTime<Utc>>,
}

impl From<RunStateSummary> for RunStateData {
    fn from(summary: RunStateSummary) -> Self {
        Self {
            workflow_instance: summary.instance,
            state: summary.state,
            state_data: summary.data,
            latest_timestamp: summary.timestamp,
        }
    }
}

/// Status rows of one backfill.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStateDataPayload {
    /// Per-instance rows, processed partitions first (reversed for reverse
    /// backfills).
    pub active_states: Vec<RunStateData>,
}

/// A backfill with optional status rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillPayload {
    /// The backfill record.
    pub backfill: Backfill,
    /// Status rows, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statuses: Option<RunStateDataPayload>,
}

/// Response body for `GET /backfills`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillsPayload {
    /// All matching backfills.
    pub backfills: Vec<BackfillPayload>,
}

/// Response body for `GET /events/{component}/{workflow}/{parameter}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPayload {
    /// The instance's logged events in counter order.
    pub events: Vec<SequencedEvent>,
}

/// Query parameters for backfill listings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// Restrict to one component.
    #[serde(default)]
    pub component: Option<String>,
    /// Restrict to one workflow name.
    #[serde(default)]
    pub workflow: Option<String>,
    /// Include per-instance statuses.
    #[serde(default)]
    pub status: Option<bool>,
    /// Include halted and completed backfills.
    #[serde(default)]
    pub show_all: Option<bool>,
}

/// Query parameters for `GET /backfills/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetParams {
    /// Include per-instance statuses (default true).
    #[serde(default)]
    pub status: Option<bool>,
}

/// Query parameters for `POST /backfills`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    /// Permit partitions that have not occurred yet.
    #[serde(default)]
    pub allow_future: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_input_parses_camel_case() {
        let input: BackfillInput = serde_json::from_str(
            r#"{
                "component": "styx",
                "workflow": "daily",
                "start": "2020-01-01T00:00:00Z",
                "end": "2020-01-05T00:00:00Z",
                "concurrency": 2,
                "reverse": true,
                "triggerParameters": {"env": {"MODE": "backfill"}}
            }"#,
        )
        .unwrap();
        assert_eq!(input.component, "styx");
        assert!(input.reverse);
        assert_eq!(
            input.trigger_parameters.unwrap().env["MODE"],
            "backfill".to_string()
        );
    }

    #[test]
    fn editable_input_defaults_optional_fields() {
        let input: EditableBackfillInput =
            serde_json::from_str(r#"{"id": "backfill-x", "concurrency": 3}"#).unwrap();
        assert_eq!(input.id, "backfill-x");
        assert_eq!(input.concurrency, Some(3));
        assert!(input.description.is_none());
    }
}
