//! Error types for the almanac domain.

use chrono::{DateTime, Utc};

/// The result type used throughout almanac-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in domain operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An event was applied to a state that does not accept it.
    #[error("illegal state transition: {from} does not accept {event}")]
    IllegalTransition {
        /// The state the event was applied to.
        from: String,
        /// The rejected event kind.
        event: String,
    },

    /// An instant is not the start of a schedule partition.
    #[error("instant {instant} is not aligned with schedule {schedule}")]
    UnalignedInstant {
        /// The offending instant.
        instant: DateTime<Utc>,
        /// The schedule it was checked against.
        schedule: String,
    },

    /// A partition parameter string could not be parsed for a schedule.
    #[error("invalid parameter {parameter:?} for schedule {schedule}")]
    InvalidParameter {
        /// The offending parameter string.
        parameter: String,
        /// The schedule it was parsed against.
        schedule: String,
    },

    /// A schedule expression could not be parsed.
    #[error("invalid schedule expression {expression:?}: {message}")]
    InvalidSchedule {
        /// The offending expression.
        expression: String,
        /// Why parsing failed.
        message: String,
    },

    /// Instant arithmetic left the representable range.
    #[error("instant out of range: {message}")]
    OutOfRange {
        /// Description of the failed computation.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_display() {
        let err = Error::IllegalTransition {
            from: "DONE".into(),
            event: "started".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("DONE"));
        assert!(msg.contains("started"));
    }

    #[test]
    fn invalid_schedule_display() {
        let err = Error::InvalidSchedule {
            expression: "every tuesday".into(),
            message: "unknown field".into(),
        };
        assert!(err.to_string().contains("every tuesday"));
    }
}
