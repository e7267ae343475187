//! The per-instance run state machine.
//!
//! A [`RunState`] is the current position of one workflow instance in its
//! lifecycle. State moves only by applying an [`Event`] through the pure
//! [`RunState::transition`] function; the resulting sequence of events is the
//! instance's durable log, and folding the log reproduces the state.
//!
//! ```text
//!  NEW ──triggerExecution──► QUEUED ──dequeue──► PREPARE ──submit──► SUBMITTING
//!                               ▲                                        │
//!                             retry                              submitted│runError
//!                               │                                        ▼
//!                        AWAITING_RETRY ◄──retryAfter── TERMINATED   SUBMITTED
//!                               │                FAILED ◄──┐             │
//!                             stop                         │          started
//!                               ▼                 terminate(exit!=0)     ▼
//!                             ERROR                        └───────── RUNNING
//!                                                                       │
//!                                              terminate(0) / success   ▼
//!                                                                     DONE
//! ```
//!
//! `halt` lands any non-terminal state in DONE; `timeout` lands any
//! non-terminal state in FAILED; `info` appends a message without moving.
//! Terminal states (`DONE`, `ERROR`) accept no further events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::id::{NATURAL_TRIGGER_LEGACY_ID, WorkflowInstance};

/// Container exit code signalling success.
pub const SUCCESS_EXIT_CODE: i32 = 0;

/// Container exit code signalling an unrecoverable failure that must not be
/// retried.
pub const UNRECOVERABLE_FAILURE_EXIT_CODE: i32 = 20;

/// The states of the run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Instance exists only as a base for the first trigger.
    New,
    /// Triggered, waiting to be dequeued.
    Queued,
    /// Dequeued, resolving the execution description.
    Prepare,
    /// Submission to the container runner in flight.
    Submitting,
    /// Accepted by the container runner.
    Submitted,
    /// Container is running.
    Running,
    /// Container exited with a retryable failure.
    Terminated,
    /// Failed before or outside normal container termination; retryable.
    Failed,
    /// Aborted after retries were exhausted. Terminal.
    Error,
    /// Waiting out the retry backoff.
    AwaitingRetry,
    /// Finished. Terminal.
    Done,
}

impl State {
    /// Returns true iff no further events are accepted in this state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Returns a lowercase label suitable for metrics and configuration keys.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Prepare => "prepare",
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::AwaitingRetry => "awaiting_retry",
            Self::Done => "done",
        }
    }

    /// All states, in lifecycle order.
    #[must_use]
    pub const fn all() -> [Self; 11] {
        [
            Self::New,
            Self::Queued,
            Self::Prepare,
            Self::Submitting,
            Self::Submitted,
            Self::Running,
            Self::Terminated,
            Self::Failed,
            Self::Error,
            Self::AwaitingRetry,
            Self::Done,
        ]
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Prepare => "PREPARE",
            Self::Submitting => "SUBMITTING",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::AwaitingRetry => "AWAITING_RETRY",
            Self::Done => "DONE",
        })
    }
}

/// Severity of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageLevel {
    /// Informational.
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// A failure.
    Error,
}

/// A line in an instance's message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Severity.
    pub level: MessageLevel,
    /// The message text.
    pub line: String,
}

impl Message {
    /// Creates an informational message.
    #[must_use]
    pub fn info(line: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Info,
            line: line.into(),
        }
    }

    /// Creates a warning message.
    #[must_use]
    pub fn warning(line: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Warning,
            line: line.into(),
        }
    }

    /// Creates an error message.
    #[must_use]
    pub fn error(line: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Error,
            line: line.into(),
        }
    }
}

/// Parameters carried by a trigger into the container environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerParameters {
    /// Extra environment variables for the execution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// The resolved description of a container execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDescription {
    /// Container image.
    pub docker_image: String,
    /// Container arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docker_args: Vec<String>,
}

/// Mutable payload accumulated by a run as it moves through the state
/// machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateData {
    /// Id of the trigger that started this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    /// Parameters carried by the trigger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_parameters: Option<TriggerParameters>,
    /// Container execution id, once submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Resolved execution description, once prepared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_description: Option<ExecutionDescription>,
    /// Number of retries scheduled so far.
    #[serde(default)]
    pub retry_cost: u32,
    /// Exit code of the last container termination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<i32>,
    /// Backoff delay of the pending retry, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_millis: Option<i64>,
    /// Message history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

/// The state of one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// The instance this state belongs to.
    pub instance: WorkflowInstance,
    /// Current position in the state machine.
    pub state: State,
    /// Accumulated run payload.
    pub data: StateData,
    /// When the current state was entered.
    pub timestamp: DateTime<Utc>,
    /// Sequence number of the last applied event. The next event must carry
    /// `counter + 1`; this is the optimistic-concurrency token.
    pub counter: u64,
}

impl RunState {
    /// Creates the base state a first trigger is applied to.
    ///
    /// `base_counter` is the highest counter already present in the
    /// instance's event log (0 if none), so that a re-triggered partition
    /// extends the log instead of colliding with retained events.
    #[must_use]
    pub fn fresh(instance: WorkflowInstance, base_counter: u64, now: DateTime<Utc>) -> Self {
        Self {
            instance,
            state: State::New,
            data: StateData::default(),
            timestamp: now,
            counter: base_counter,
        }
    }

    /// Applies an event, producing the next state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransition`] if the current state does not
    /// accept the event.
    pub fn transition(&self, event: &Event, now: DateTime<Utc>) -> Result<Self> {
        let illegal = || Error::IllegalTransition {
            from: self.state.to_string(),
            event: event.kind().to_string(),
        };

        if self.state.is_terminal() {
            return Err(illegal());
        }

        let mut data = self.data.clone();
        let next = match (self.state, event) {
            (State::New, Event::TriggerExecution { trigger_id, parameters }) => {
                data.trigger_id = Some(trigger_id.clone());
                data.trigger_parameters = Some(parameters.clone());
                State::Queued
            }
            (State::New, Event::TimeTrigger) => {
                data.trigger_id = Some(NATURAL_TRIGGER_LEGACY_ID.to_string());
                State::Queued
            }
            (State::Queued, Event::Dequeue) => State::Prepare,
            (State::Prepare, Event::Submit { description }) => {
                data.execution_description = Some(description.clone());
                State::Submitting
            }
            (State::Prepare | State::Submitting, Event::Created { execution_id })
            | (State::Submitting, Event::Submitted { execution_id }) => {
                data.execution_id = Some(execution_id.clone());
                State::Submitted
            }
            (State::Submitted, Event::Started) => State::Running,
            (
                State::Prepare | State::Submitting | State::Submitted | State::Running,
                Event::RunError { message },
            ) => {
                data.messages.push(Message::error(message.clone()));
                State::Failed
            }
            (State::Running, Event::Terminate { exit_code }) => {
                data.last_exit = Some(*exit_code);
                match *exit_code {
                    SUCCESS_EXIT_CODE => State::Done,
                    UNRECOVERABLE_FAILURE_EXIT_CODE => {
                        data.messages
                            .push(Message::error(format!("exit code {exit_code}")));
                        State::Failed
                    }
                    _ => State::Terminated,
                }
            }
            (State::Running, Event::Success) => State::Done,
            (State::Terminated | State::Failed, Event::RetryAfter { delay_millis }) => {
                data.retry_delay_millis = Some(*delay_millis);
                data.retry_cost += 1;
                State::AwaitingRetry
            }
            (State::AwaitingRetry, Event::Retry) => {
                data.execution_id = None;
                data.execution_description = None;
                data.retry_delay_millis = None;
                State::Queued
            }
            (
                State::Queued | State::Terminated | State::Failed | State::AwaitingRetry,
                Event::Stop,
            ) => State::Error,
            (_, Event::Halt) => State::Done,
            (_, Event::Timeout) => {
                data.messages.push(Message::warning("hit deadline"));
                State::Failed
            }
            (_, Event::Info { message }) => {
                data.messages.push(message.clone());
                self.state
            }
            _ => return Err(illegal()),
        };

        Ok(Self {
            instance: self.instance.clone(),
            state: next,
            data,
            timestamp: now,
            counter: self.counter + 1,
        })
    }
}
