//! # almanac-core
//!
//! Domain model for the almanac workflow scheduler.
//!
//! Almanac drives time-partitioned, containerized workflow executions. This
//! crate holds the pure domain types shared by the engine and the HTTP
//! surface:
//!
//! - **Identity**: workflows and their per-partition instances
//! - **Schedules**: a closed set of partitionings plus cron expressions, with
//!   alignment and partition-parameter arithmetic
//! - **Run state machine**: the per-instance state transition function folded
//!   over the event log
//! - **Events**: the closed, serializable event alphabet of the state machine
//! - **Backfills**: bounded replays of historical partitions
//!
//! ## Guarantees
//!
//! - **Pure transitions**: `RunState::transition` has no side effects; the
//!   same state and event always produce the same next state
//! - **Replayable**: folding an instance's event log reconstructs its state
//!   deterministically
//! - **Closed alphabet**: events and states are closed enums; unknown input
//!   is a deserialization error, never a silent fallback

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backfill;
pub mod error;
pub mod event;
pub mod id;
pub mod observability;
pub mod retry;
pub mod schedule;
pub mod state;
pub mod workflow;

pub use backfill::Backfill;
pub use error::{Error, Result};
pub use event::{Event, SequencedEvent};
pub use id::{WorkflowId, WorkflowInstance};
pub use schedule::Schedule;
pub use state::{RunState, State, StateData};
pub use workflow::{Workflow, WorkflowConfiguration};
