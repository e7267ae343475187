//! The event alphabet of the run state machine.
//!
//! Events are the only way state moves. Each applied event is persisted as a
//! [`SequencedEvent`] carrying the counter it produced; the per-instance
//! sequence of counters is gapless and strictly increasing, and doubles as
//! the optimistic-concurrency token of the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::WorkflowInstance;
use crate::state::{ExecutionDescription, Message, TriggerParameters};

/// An event applied to a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    /// Legacy natural trigger without an explicit trigger id.
    TimeTrigger,
    /// A trigger for this partition, with a globally unique trigger id.
    TriggerExecution {
        /// The trigger id (`natural-…` or a backfill id).
        trigger_id: String,
        /// Parameters carried into the execution.
        #[serde(default)]
        parameters: TriggerParameters,
    },
    /// The instance left the queue and preparation begins.
    Dequeue,
    /// The execution description was resolved; submission may begin.
    Submit {
        /// The resolved execution description.
        description: ExecutionDescription,
    },
    /// The container runner accepted the submission.
    Submitted {
        /// The runner's execution id.
        execution_id: String,
    },
    /// Legacy submission acknowledgement.
    Created {
        /// The runner's execution id.
        execution_id: String,
    },
    /// The container started running.
    Started,
    /// The container exited.
    Terminate {
        /// The container exit code.
        exit_code: i32,
    },
    /// A failure outside normal container termination.
    RunError {
        /// Failure description.
        message: String,
    },
    /// Explicit success signal.
    Success,
    /// Schedule a retry after a backoff delay.
    RetryAfter {
        /// Backoff delay in milliseconds.
        delay_millis: i64,
    },
    /// The backoff elapsed; re-queue the instance.
    Retry,
    /// Abort retrying; the instance ends in ERROR.
    Stop,
    /// The instance exceeded the TTL of its current state.
    Timeout,
    /// Operator abort; the instance ends in DONE.
    Halt,
    /// Append a message without changing state.
    Info {
        /// The message to append.
        message: Message,
    },
}

impl Event {
    /// Returns the event kind name as it appears on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TimeTrigger => "timeTrigger",
            Self::TriggerExecution { .. } => "triggerExecution",
            Self::Dequeue => "dequeue",
            Self::Submit { .. } => "submit",
            Self::Submitted { .. } => "submitted",
            Self::Created { .. } => "created",
            Self::Started => "started",
            Self::Terminate { .. } => "terminate",
            Self::RunError { .. } => "runError",
            Self::Success => "success",
            Self::RetryAfter { .. } => "retryAfter",
            Self::Retry => "retry",
            Self::Stop => "stop",
            Self::Timeout => "timeout",
            Self::Halt => "halt",
            Self::Info { .. } => "info",
        }
    }
}

/// A logged event: the event plus its position in the instance's sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedEvent {
    /// The instance the event was applied to.
    pub instance: WorkflowInstance,
    /// The counter produced by applying the event; one past the counter of
    /// the state it was applied to.
    pub counter: u64,
    /// When the event was applied.
    pub timestamp: DateTime<Utc>,
    /// The event itself.
    pub event: Event,
}
