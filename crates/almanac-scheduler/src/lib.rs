//! # almanac-scheduler
//!
//! The engine of the almanac workflow scheduler.
//!
//! This crate drives time-partitioned, containerized workflow executions:
//!
//! - **State manager**: an event-serialized, sharded driver of the
//!   per-instance state machine, with replay-from-log recovery
//! - **Scheduler tick**: timeout enforcement, dequeueing, and retry firing
//! - **Trigger manager**: natural trigger emission as wall-clock time passes
//!   partition boundaries
//! - **Backfill engine**: bounded, monotonic replays of historical partitions
//!   under per-backfill concurrency caps
//! - **Submission pipeline**: rate-limited dispatch to an external container
//!   runner
//!
//! ## Durability model
//!
//! Every state transition is appended to a per-instance event log before any
//! side effect runs; the active-instance index is updated in the same storage
//! transaction. On restart, replaying each active instance's log rebuilds the
//! in-memory state; replay is the only recovery mechanism.
//!
//! ## Concurrency model
//!
//! Events for one instance are serialized by hashing instances onto
//! single-threaded shard workers. Output handlers run on separate spawned
//! tasks so runner RPC latency never stalls a shard. Tickers are
//! non-overlapping; a slow tick delays, never compounds, the next.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backfill;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod replay;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod state_manager;
pub mod storage;
pub mod trigger;

pub use backfill::{BackfillManager, CreateBackfillRequest};
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use rate_limit::SubmissionRateLimiter;
pub use runner::{DockerRunner, RunSpec};
pub use scheduler::{Scheduler, TimeoutConfig};
pub use state_manager::{EventSink, StateManager};
pub use storage::{Storage, memory::MemStorage};
pub use trigger::TriggerManager;
