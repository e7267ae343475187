//! Pluggable storage for the scheduler engine.
//!
//! The [`Storage`] trait is the persistence contract: an append-only
//! per-instance event log with an optimistic counter, the active-instance
//! index maintained atomically with appends, workflow and backfill rows, and
//! the global runtime configuration. Production deployments back it with a
//! wide-column log store plus a transactional document store; development
//! mode and tests use [`memory::MemStorage`].
//!
//! ## Atomicity contract
//!
//! `append_event` MUST perform the counter check, the event append and the
//! index update in one transaction. `append_trigger_event` additionally
//! persists the advanced backfill row in the same transaction, so that a
//! crash between trigger emission and cursor advancement cannot duplicate a
//! trigger. `update_backfill` MUST read-then-write the backfill row inside
//! one transaction to avoid lost updates.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use almanac_core::{Backfill, RunState, SequencedEvent, Workflow, WorkflowId, WorkflowInstance};

use crate::error::Result;

/// One row of the active-instance index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEntry {
    /// Counter of the instance's last logged event.
    pub counter: u64,
    /// Trigger id that started the active run, if known.
    pub trigger_id: Option<String>,
}

/// Filter for backfill listings.
#[derive(Debug, Clone, Default)]
pub struct BackfillFilter {
    /// Include halted and completed backfills.
    pub show_all: bool,
    /// Restrict to one component.
    pub component: Option<String>,
    /// Restrict to one workflow name.
    pub workflow: Option<String>,
}

/// Storage abstraction for the scheduler engine.
///
/// Implementations must be safe for concurrent use from multiple engine
/// tasks; every mutation method is a single storage transaction.
#[async_trait]
pub trait Storage: Send + Sync {
    // --- Event log (C1) ---

    /// Atomically appends an event and applies the resulting state to the
    /// active-instance index.
    ///
    /// The stored latest counter for the instance must equal
    /// `event.counter - 1` (no events stored counts as 0); otherwise the
    /// append fails with a counter conflict and nothing is written. If
    /// `new_state` is terminal the index entry is removed, else it is
    /// upserted with the event's counter and the state's trigger id.
    async fn append_event(&self, event: &SequencedEvent, new_state: &RunState) -> Result<()>;

    /// Like [`Storage::append_event`], additionally persisting the advanced
    /// backfill row in the same transaction.
    async fn append_trigger_event(
        &self,
        event: &SequencedEvent,
        new_state: &RunState,
        backfill: &Backfill,
    ) -> Result<()>;

    /// Reads an instance's events in counter order.
    async fn read_events(&self, instance: &WorkflowInstance) -> Result<Vec<SequencedEvent>>;

    /// Returns the counter of the instance's latest stored event.
    async fn latest_counter(&self, instance: &WorkflowInstance) -> Result<Option<u64>>;

    // --- Active-instance index ---

    /// Reads the whole active-instance index.
    async fn read_active_instances(&self) -> Result<HashMap<WorkflowInstance, ActiveEntry>>;

    /// Reads the index entries of one component.
    async fn read_active_instances_for_component(
        &self,
        component: &str,
    ) -> Result<HashMap<WorkflowInstance, ActiveEntry>>;

    /// Reads the index entries whose run was started by the given trigger.
    async fn read_active_instances_by_trigger(
        &self,
        trigger_id: &str,
    ) -> Result<HashMap<WorkflowInstance, ActiveEntry>>;

    // --- Workflows ---

    /// Reads a workflow.
    async fn workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>>;

    /// Stores (inserts or replaces) a workflow.
    async fn store_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Deletes a workflow and its trigger bookkeeping.
    async fn delete_workflow(&self, id: &WorkflowId) -> Result<()>;

    /// Returns every workflow together with its next natural trigger
    /// instant, where one has been initialized.
    async fn workflows_with_next_natural_trigger(
        &self,
    ) -> Result<Vec<(Workflow, DateTime<Utc>)>>;

    /// Moves a workflow's next natural trigger instant.
    async fn update_next_natural_trigger(
        &self,
        id: &WorkflowId,
        next: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns whether natural triggering is enabled for a workflow.
    async fn is_enabled(&self, id: &WorkflowId) -> Result<bool>;

    /// Enables or disables natural triggering for a workflow.
    async fn set_enabled(&self, id: &WorkflowId, enabled: bool) -> Result<()>;

    // --- Backfills ---

    /// Reads a backfill.
    async fn backfill(&self, id: &str) -> Result<Option<Backfill>>;

    /// Stores (inserts or replaces) a backfill.
    async fn store_backfill(&self, backfill: &Backfill) -> Result<()>;

    /// Lists backfills matching a filter, FIFO by creation time.
    ///
    /// Unless `show_all` is set, halted and fully triggered backfills are
    /// excluded.
    async fn backfills(&self, filter: &BackfillFilter) -> Result<Vec<Backfill>>;

    /// Mutates a backfill row inside a read-then-write transaction and
    /// returns the stored result.
    async fn update_backfill(
        &self,
        id: &str,
        mutate: &(dyn for<'r> Fn(&'r mut Backfill) + Send + Sync),
    ) -> Result<Backfill>;

    // --- Runtime configuration ---

    /// Reads the configured global submission rate, if set.
    async fn submission_rate_limit(&self) -> Result<Option<f64>>;

    /// Sets the global submission rate.
    async fn set_submission_rate_limit(&self, permits_per_sec: f64) -> Result<()>;
}
