//! Backfill records.
//!
//! A backfill is a bounded, replayable set of triggers for historical
//! partitions with its own concurrency cap. The engine advances the
//! `next_trigger` cursor monotonically (forward, or backward for reverse
//! backfills) and never emits a trigger for a halted backfill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::WorkflowId;
use crate::schedule::Schedule;
use crate::state::TriggerParameters;

/// A bounded replay of historical partitions.
///
/// Invariants maintained by the engine:
///
/// - `start < end`, both schedule-aligned
/// - the cursor moves strictly forward (reverse: strictly backward)
/// - `halted` implies no further triggers are emitted
/// - `all_triggered` implies the cursor reached `end` (forward) or passed
///   below `start` (reverse)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backfill {
    /// Unique backfill id (`backfill-…`); doubles as the trigger id of every
    /// instance it starts.
    pub id: String,
    /// The workflow being backfilled.
    pub workflow_id: WorkflowId,
    /// Start of the partition range (inclusive, aligned).
    pub start: DateTime<Utc>,
    /// End of the partition range (exclusive, aligned).
    pub end: DateTime<Utc>,
    /// The workflow's schedule at creation time.
    pub schedule: Schedule,
    /// Maximum simultaneously active instances of this backfill.
    pub concurrency: u32,
    /// The next partition instant to trigger.
    pub next_trigger: DateTime<Utc>,
    /// Operator-facing description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether partitions are triggered newest-first.
    #[serde(default)]
    pub reverse: bool,
    /// Whether every partition in the range has been triggered.
    #[serde(default)]
    pub all_triggered: bool,
    /// Whether the backfill was halted; halting is terminal.
    #[serde(default)]
    pub halted: bool,
    /// Parameters passed to every triggered instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_parameters: Option<TriggerParameters>,
    /// When the backfill was created; advancer ordering is FIFO on this.
    pub created: DateTime<Utc>,
}

impl Backfill {
    /// Enumerates the backfill's partition instants, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored range is not aligned with the stored
    /// schedule.
    pub fn partitions(&self) -> Result<Vec<DateTime<Utc>>> {
        self.schedule.instants_in_range(self.start, self.end)
    }
}
