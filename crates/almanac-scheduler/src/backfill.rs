//! The backfill engine.
//!
//! A backfill drives the aligned instants of `[start, end)` through the
//! state manager under three constraints: at most `concurrency` of its
//! instances are simultaneously active; the cursor advances strictly forward
//! (or strictly backward for reverse backfills); and halting is terminal:
//! no further triggers, though in-flight instances continue.
//!
//! Each trigger and its cursor advance are persisted in one storage
//! transaction, so a crash cannot duplicate a trigger. An instance that is
//! already active under a different trigger is skipped with a warning and
//! the cursor still advances: at-least-once with dedup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use almanac_core::id::backfill_id;
use almanac_core::state::{StateData, TriggerParameters};
use almanac_core::{Backfill, Event, WorkflowId, WorkflowInstance};

use crate::error::{Error, Result};
use crate::metrics::{labels, names, time_tick};
use crate::replay;
use crate::state_manager::{EventSink, StateManager};
use crate::storage::{BackfillFilter, Storage};

/// Synthetic state label for a partition not yet triggered.
const WAITING: &str = "WAITING";

/// Synthetic state label for a triggered partition with no reconstructable
/// state.
const UNKNOWN: &str = "UNKNOWN";

/// Request to create a new backfill.
#[derive(Debug, Clone)]
pub struct CreateBackfillRequest {
    /// The workflow to backfill.
    pub workflow_id: WorkflowId,
    /// Start of the partition range (inclusive).
    pub start: DateTime<Utc>,
    /// End of the partition range (exclusive).
    pub end: DateTime<Utc>,
    /// Maximum simultaneously active instances.
    pub concurrency: u32,
    /// Operator-facing description.
    pub description: Option<String>,
    /// Trigger partitions newest-first.
    pub reverse: bool,
    /// Parameters passed to every triggered instance.
    pub trigger_parameters: Option<TriggerParameters>,
    /// Permit partitions that have not occurred yet.
    pub allow_future: bool,
}

/// Outcome of halting a backfill.
#[derive(Debug, Clone)]
pub struct HaltOutcome {
    /// Number of active instances a halt event was posted to.
    pub halted: usize,
    /// Parameters of instances that could not be halted. The backfill's
    /// halted flag is durable regardless.
    pub failed: Vec<String>,
}

/// One row of a backfill status report.
#[derive(Debug, Clone)]
pub struct RunStateSummary {
    /// The partition instance.
    pub instance: WorkflowInstance,
    /// State label; a machine state name, `WAITING` or `UNKNOWN`.
    pub state: String,
    /// State payload (zero for synthetic states).
    pub data: StateData,
    /// When the state was entered, where known.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Creates, advances, reports and halts backfills.
pub struct BackfillManager {
    storage: Arc<dyn Storage>,
    state_manager: Arc<StateManager>,
    ticking: Mutex<()>,
}

impl BackfillManager {
    /// Creates a backfill manager.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, state_manager: Arc<StateManager>) -> Self {
        Self {
            storage,
            state_manager,
            ticking: Mutex::new(()),
        }
    }

    /// Validates and persists a new backfill.
    ///
    /// # Errors
    ///
    /// - [`Error::WorkflowNotFound`] if the workflow does not exist
    /// - [`Error::InvalidRequest`] for an unconfigured workflow, an inverted
    ///   or unaligned range, or future partitions without `allow_future`
    /// - [`Error::BackfillConflict`] if a partition in the range is active
    ///   under a different trigger
    pub async fn create(
        &self,
        request: CreateBackfillRequest,
        now: DateTime<Utc>,
    ) -> Result<Backfill> {
        let workflow = self
            .storage
            .workflow(&request.workflow_id)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(request.workflow_id.clone()))?;

        if !workflow.is_configured() {
            return Err(Error::InvalidRequest(
                "workflow is missing docker image".into(),
            ));
        }
        if request.start >= request.end {
            return Err(Error::InvalidRequest("start must be before end".into()));
        }
        let schedule = workflow.schedule.clone();
        if !schedule.is_aligned(request.start) {
            return Err(Error::InvalidRequest(
                "start parameter not aligned with schedule".into(),
            ));
        }
        if !schedule.is_aligned(request.end) {
            return Err(Error::InvalidRequest(
                "end parameter not aligned with schedule".into(),
            ));
        }
        if request.concurrency == 0 {
            return Err(Error::InvalidRequest(
                "concurrency must be greater than zero".into(),
            ));
        }
        if !request.allow_future
            && (request.start > now || schedule.previous_instant(request.end)? > now)
        {
            return Err(Error::InvalidRequest(
                "cannot backfill future partitions".into(),
            ));
        }

        let instants = schedule.instants_in_range(request.start, request.end)?;

        // Reject if any partition is already running under another trigger.
        let active = self
            .storage
            .read_active_instances_for_component(&request.workflow_id.component)
            .await?;
        let already_active: Vec<String> = instants
            .iter()
            .map(|instant| schedule.to_parameter(*instant))
            .filter(|parameter| {
                active.contains_key(&WorkflowInstance::new(
                    request.workflow_id.clone(),
                    parameter.clone(),
                ))
            })
            .collect();
        if !already_active.is_empty() {
            return Err(Error::BackfillConflict {
                parameters: already_active,
            });
        }

        let next_trigger = if request.reverse {
            *instants.last().ok_or_else(|| {
                Error::InvalidRequest("partition range resolves to zero partitions".into())
            })?
        } else {
            request.start
        };

        let backfill = Backfill {
            id: backfill_id(),
            workflow_id: request.workflow_id,
            start: request.start,
            end: request.end,
            schedule,
            concurrency: request.concurrency,
            next_trigger,
            description: request.description,
            reverse: request.reverse,
            all_triggered: false,
            halted: false,
            trigger_parameters: request.trigger_parameters,
            created: now,
        };
        self.storage.store_backfill(&backfill).await?;
        info!(backfill = %backfill.id, workflow = %backfill.workflow_id, "backfill created");
        Ok(backfill)
    }

    /// Runs one advancement tick over every unhalted, incomplete backfill,
    /// FIFO by creation time. Skips (with a warning) if the previous tick is
    /// still running.
    pub async fn tick(&self) {
        let Ok(_guard) = self.ticking.try_lock() else {
            warn!("previous backfill tick still running, skipping");
            return;
        };
        let _timing = time_tick("backfill");

        let backfills = match self.storage.backfills(&BackfillFilter::default()).await {
            Ok(backfills) => backfills,
            Err(error) => {
                warn!(error = %error, "failed to read backfills, skipping tick");
                return;
            }
        };

        for backfill in backfills {
            let id = backfill.id.clone();
            if let Err(error) = self.advance(backfill).await {
                warn!(backfill = %id, error = %error, "backfill advancement failed");
            }
        }
    }

    /// Triggers partitions of one backfill up to its concurrency cap.
    async fn advance(&self, mut backfill: Backfill) -> Result<()> {
        let active = self
            .storage
            .read_active_instances_by_trigger(&backfill.id)
            .await?;
        #[allow(clippy::cast_possible_truncation)]
        let mut remaining = backfill.concurrency.saturating_sub(active.len() as u32);

        while remaining > 0 && !backfill.all_triggered {
            let parameter = backfill.schedule.to_parameter(backfill.next_trigger);
            let instance = WorkflowInstance::new(backfill.workflow_id.clone(), parameter);
            let advanced = advance_cursor(&backfill)?;

            let parameters = backfill.trigger_parameters.clone().unwrap_or_default();
            match self
                .state_manager
                .trigger(
                    instance.clone(),
                    backfill.id.clone(),
                    parameters,
                    Some(advanced.clone()),
                )
                .await
            {
                Ok(()) => {
                    info!(backfill = %backfill.id, instance = %instance, "backfill trigger");
                    metrics::counter!(names::TRIGGERS_TOTAL, labels::SOURCE => "backfill")
                        .increment(1);
                    remaining -= 1;
                }
                Err(Error::AlreadyActive { .. }) => {
                    // Another trigger owns this partition; pass it by
                    // without consuming concurrency.
                    warn!(
                        backfill = %backfill.id,
                        instance = %instance,
                        "partition already active under another trigger, skipping"
                    );
                    self.storage.store_backfill(&advanced).await?;
                }
                Err(error) => return Err(error),
            }
            backfill = advanced;
        }
        Ok(())
    }

    /// Reports the state of every partition in a backfill.
    ///
    /// Processed partitions report their live state, a state replayed from
    /// the log, or `UNKNOWN`; waiting partitions report `WAITING`. This read
    /// is weakly consistent by design and may lag live state by one tick.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the stored range is unaligned.
    pub async fn status(&self, backfill: &Backfill) -> Result<Vec<RunStateSummary>> {
        let schedule = &backfill.schedule;
        let (processed_instants, waiting_instants) = if backfill.reverse {
            let boundary = schedule.next_instant(backfill.next_trigger)?;
            (
                schedule.instants_in_range(boundary, backfill.end)?,
                schedule.instants_in_range(backfill.start, boundary)?,
            )
        } else {
            (
                schedule.instants_in_range(backfill.start, backfill.next_trigger)?,
                schedule.instants_in_range(backfill.next_trigger, backfill.end)?,
            )
        };

        let live = self.state_manager.active_states().await;

        let mut processed = Vec::with_capacity(processed_instants.len());
        for instant in processed_instants {
            let instance =
                WorkflowInstance::new(backfill.workflow_id.clone(), schedule.to_parameter(instant));
            let summary = match live
                .get(&instance)
                .filter(|state| state.data.trigger_id.as_deref() == Some(backfill.id.as_str()))
            {
                Some(state) => RunStateSummary {
                    instance,
                    state: state.state.to_string(),
                    data: state.data.clone(),
                    timestamp: Some(state.timestamp),
                },
                None => {
                    match replay::backfill_run_state(self.storage.as_ref(), &instance, &backfill.id)
                        .await?
                    {
                        Some(state) => RunStateSummary {
                            instance,
                            state: state.state.to_string(),
                            data: state.data.clone(),
                            timestamp: Some(state.timestamp),
                        },
                        None => RunStateSummary {
                            instance,
                            state: UNKNOWN.to_string(),
                            data: StateData::default(),
                            timestamp: None,
                        },
                    }
                }
            };
            processed.push(summary);
        }

        let waiting = waiting_instants.into_iter().map(|instant| RunStateSummary {
            instance: WorkflowInstance::new(
                backfill.workflow_id.clone(),
                schedule.to_parameter(instant),
            ),
            state: WAITING.to_string(),
            data: StateData::default(),
            timestamp: None,
        });

        // Forward: processed then waiting; reverse: waiting then processed.
        Ok(if backfill.reverse {
            waiting.chain(processed).collect()
        } else {
            processed.into_iter().chain(waiting).collect()
        })
    }

    /// Halts a backfill: durably flips the halted flag, then posts `halt` to
    /// each of its active instances, best effort.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackfillNotFound`] if the backfill does not exist,
    /// or a storage error from the flag flip. Per-instance halt failures are
    /// reported in the outcome, not as an error.
    pub async fn halt(&self, id: &str) -> Result<HaltOutcome> {
        self.storage.update_backfill(id, &|b| b.halted = true).await?;
        info!(backfill = %id, "backfill halted");

        let active = self.storage.read_active_instances_by_trigger(id).await?;
        let mut halted = 0;
        let mut failed = Vec::new();
        for instance in active.keys() {
            match self.state_manager.receive(instance, Event::Halt).await {
                Ok(()) => halted += 1,
                Err(error) => {
                    warn!(instance = %instance, error = %error, "failed to halt instance");
                    failed.push(instance.parameter.clone());
                }
            }
        }
        failed.sort();
        Ok(HaltOutcome { halted, failed })
    }

    /// Updates the mutable backfill fields (concurrency and description)
    /// inside a read-then-write storage transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackfillNotFound`] if the backfill does not exist,
    /// or [`Error::InvalidRequest`] for a zero concurrency.
    pub async fn update(
        &self,
        id: &str,
        concurrency: Option<u32>,
        description: Option<String>,
    ) -> Result<Backfill> {
        if concurrency == Some(0) {
            return Err(Error::InvalidRequest(
                "concurrency must be greater than zero".into(),
            ));
        }
        self.storage
            .update_backfill(id, &move |backfill| {
                if let Some(concurrency) = concurrency {
                    backfill.concurrency = concurrency;
                }
                if let Some(description) = description.clone() {
                    backfill.description = Some(description);
                }
            })
            .await
    }
}

/// Computes the backfill with its cursor moved past `next_trigger`.
fn advance_cursor(backfill: &Backfill) -> Result<Backfill> {
    let mut advanced = backfill.clone();
    if backfill.reverse {
        let cursor = backfill.schedule.previous_instant(backfill.next_trigger)?;
        advanced.all_triggered = cursor < backfill.start;
        advanced.next_trigger = cursor;
    } else {
        let cursor = backfill.schedule.next_instant(backfill.next_trigger)?;
        advanced.all_triggered = cursor >= backfill.end;
        advanced.next_trigger = cursor;
    }
    Ok(advanced)
}
