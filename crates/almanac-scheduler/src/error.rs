//! Error types for the scheduler engine.

use almanac_core::{WorkflowId, WorkflowInstance};

/// The result type used throughout almanac-scheduler.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The state manager no longer accepts events.
    #[error("state manager is closed")]
    IsClosed,

    /// An event arrived for an instance that is not active.
    #[error("workflow instance is not active: {instance}")]
    NotActive {
        /// The inactive instance.
        instance: WorkflowInstance,
    },

    /// A trigger arrived for an instance that is already active.
    #[error("workflow instance is already active: {instance}")]
    AlreadyActive {
        /// The active instance.
        instance: WorkflowInstance,
    },

    /// An optimistic append lost the race for an instance's counter.
    #[error("counter conflict for {instance}: expected stored counter {expected}, found {actual}")]
    CounterConflict {
        /// The contended instance.
        instance: WorkflowInstance,
        /// The stored counter the append expected.
        expected: u64,
        /// The stored counter actually found.
        actual: u64,
    },

    /// A domain error (illegal transition, schedule arithmetic, parsing).
    #[error(transparent)]
    Core(#[from] almanac_core::Error),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// The container runner rejected or failed an operation.
    #[error("runner error: {message}")]
    Runner {
        /// Description of the failure.
        message: String,
    },

    /// A workflow was not found.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    /// A backfill was not found.
    #[error("backfill not found: {0}")]
    BackfillNotFound(String),

    /// A request failed validation.
    #[error("{0}")]
    InvalidRequest(String),

    /// A backfill range intersects instances active under another trigger.
    #[error("these partitions are already active: {}", parameters.join(", "))]
    BackfillConflict {
        /// The offending partition parameters.
        parameters: Vec<String>,
    },

    /// The engine configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },
}

impl Error {
    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a runner error.
    #[must_use]
    pub fn runner(message: impl Into<String>) -> Self {
        Self::Runner {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use almanac_core::WorkflowId;

    #[test]
    fn backfill_conflict_lists_parameters() {
        let err = Error::BackfillConflict {
            parameters: vec!["2020-01-01".into(), "2020-01-02".into()],
        };
        assert_eq!(
            err.to_string(),
            "these partitions are already active: 2020-01-01, 2020-01-02"
        );
    }

    #[test]
    fn core_errors_pass_through() {
        let core = almanac_core::Error::IllegalTransition {
            from: "DONE".into(),
            event: "started".into(),
        };
        let err = Error::from(core);
        assert!(err.to_string().contains("illegal state transition"));
    }

    #[test]
    fn workflow_not_found_display() {
        let err = Error::WorkflowNotFound(WorkflowId::new("styx", "daily"));
        assert!(err.to_string().contains("styx#daily"));
    }
}
