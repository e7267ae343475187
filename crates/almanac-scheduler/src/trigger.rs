//! Natural trigger management.
//!
//! Every tick, workflows whose `next_natural_trigger` instant has passed get
//! a `triggerExecution` for that partition, and the instant advances to the
//! successor partition. Disabled and unconfigured workflows still advance,
//! so re-enabling a workflow does not unleash a backlog of stale partitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use almanac_core::id::natural_trigger_id;
use almanac_core::state::TriggerParameters;
use almanac_core::{Workflow, WorkflowInstance};

use crate::error::{Error, Result};
use crate::metrics::{labels, names, time_tick};
use crate::state_manager::StateManager;
use crate::storage::Storage;

/// Emits natural triggers as wall-clock time passes partition boundaries.
pub struct TriggerManager {
    storage: Arc<dyn Storage>,
    state_manager: Arc<StateManager>,
    ticking: Mutex<()>,
}

impl TriggerManager {
    /// Creates a trigger manager.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, state_manager: Arc<StateManager>) -> Self {
        Self {
            storage,
            state_manager,
            ticking: Mutex::new(()),
        }
    }

    /// Runs one tick. Skips (with a warning) if the previous tick is still
    /// running.
    pub async fn tick(&self) {
        let Ok(_guard) = self.ticking.try_lock() else {
            warn!("previous trigger-manager tick still running, skipping");
            return;
        };
        let _timing = time_tick("trigger");

        let now = Utc::now();
        let workflows = match self.storage.workflows_with_next_natural_trigger().await {
            Ok(workflows) => workflows,
            Err(error) => {
                warn!(error = %error, "failed to read workflows, skipping tick");
                return;
            }
        };

        for (workflow, next_trigger) in workflows {
            if next_trigger > now {
                continue;
            }
            if let Err(error) = self.fire(&workflow, next_trigger).await {
                warn!(
                    workflow = %workflow.id,
                    error = %error,
                    "natural trigger failed, will retry next tick"
                );
            }
        }
    }

    /// Fires one natural trigger and advances the workflow's trigger instant.
    ///
    /// The instant advances even for disabled or unconfigured workflows; a
    /// storage failure leaves it in place so the next tick retries.
    async fn fire(&self, workflow: &Workflow, instant: DateTime<Utc>) -> Result<()> {
        let enabled = self.storage.is_enabled(&workflow.id).await?;

        if enabled && workflow.is_configured() {
            let parameter = workflow.schedule.to_parameter(instant);
            let instance = WorkflowInstance::new(workflow.id.clone(), parameter);
            let trigger_result = self
                .state_manager
                .trigger(
                    instance.clone(),
                    natural_trigger_id(),
                    TriggerParameters::default(),
                    None,
                )
                .await;
            match trigger_result {
                Ok(()) => {
                    info!(instance = %instance, "natural trigger");
                    metrics::counter!(names::TRIGGERS_TOTAL, labels::SOURCE => "natural")
                        .increment(1);
                }
                Err(Error::AlreadyActive { .. }) => {
                    debug!(instance = %instance, "instance already active, advancing");
                }
                Err(error) => return Err(error),
            }
        } else {
            debug!(
                workflow = %workflow.id,
                enabled,
                configured = workflow.is_configured(),
                "skipping natural trigger"
            );
        }

        let successor = workflow.schedule.next_instant(instant)?;
        self.storage
            .update_next_natural_trigger(&workflow.id, successor)
            .await
    }
}

/// Stores a workflow and (re-)initializes its natural trigger bookkeeping.
///
/// On first registration, and whenever the schedule partitioning changes,
/// the next natural trigger is set to the first aligned instant at or after
/// `now`.
///
/// # Errors
///
/// Returns an error if storage fails or the schedule arithmetic does.
pub async fn register_workflow(
    storage: &dyn Storage,
    workflow: &Workflow,
    now: DateTime<Utc>,
) -> Result<()> {
    let existing = storage.workflow(&workflow.id).await?;
    storage.store_workflow(workflow).await?;

    let repartitioned = existing.is_none_or(|old| old.schedule != workflow.schedule);
    if repartitioned {
        let next = workflow.schedule.first_instant_at_or_after(now)?;
        info!(workflow = %workflow.id, next = %next, "initializing next natural trigger");
        storage
            .update_next_natural_trigger(&workflow.id, next)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use almanac_core::workflow::WorkflowConfiguration;
    use almanac_core::{Schedule, State, WorkflowId};
    use chrono::{Duration, TimeZone};

    use crate::storage::memory::MemStorage;

    fn workflow(image: Option<&str>) -> Workflow {
        Workflow::new(
            WorkflowId::new("styx", "daily"),
            Schedule::Days,
            WorkflowConfiguration {
                docker_image: image.map(str::to_string),
                ..WorkflowConfiguration::default()
            },
        )
    }

    async fn setup(image: Option<&str>) -> (Arc<MemStorage>, Arc<StateManager>, TriggerManager) {
        let storage = Arc::new(MemStorage::new());
        let past = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        register_workflow(storage.as_ref(), &workflow(image), past)
            .await
            .unwrap();

        let manager = StateManager::new(Arc::clone(&storage) as Arc<dyn Storage>);
        manager.start(2).await;
        let triggers = TriggerManager::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::clone(&manager),
        );
        (storage, manager, triggers)
    }

    #[tokio::test]
    async fn due_workflow_is_triggered_and_advanced() {
        let (storage, manager, triggers) = setup(Some("busybox:1")).await;

        triggers.tick().await;

        let states = manager.active_states().await;
        assert_eq!(states.len(), 1);
        let state = states.values().next().unwrap();
        assert_eq!(state.state, State::Queued);
        assert_eq!(state.instance.parameter, "2020-01-01");
        assert!(
            state
                .data
                .trigger_id
                .as_deref()
                .unwrap()
                .starts_with("natural-")
        );

        // The trigger instant moved to the successor partition.
        let rows = storage.workflows_with_next_natural_trigger().await.unwrap();
        assert_eq!(
            rows[0].1,
            Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn unconfigured_workflow_advances_without_triggering() {
        let (storage, manager, triggers) = setup(None).await;

        triggers.tick().await;

        assert!(manager.active_states().await.is_empty());
        let rows = storage.workflows_with_next_natural_trigger().await.unwrap();
        assert_eq!(
            rows[0].1,
            Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn disabled_workflow_advances_without_triggering() {
        let (storage, manager, triggers) = setup(Some("busybox:1")).await;
        storage
            .set_enabled(&WorkflowId::new("styx", "daily"), false)
            .await
            .unwrap();

        triggers.tick().await;

        assert!(manager.active_states().await.is_empty());
        let rows = storage.workflows_with_next_natural_trigger().await.unwrap();
        assert_eq!(
            rows[0].1,
            Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn future_trigger_instants_are_left_alone() {
        let storage = Arc::new(MemStorage::new());
        register_workflow(
            storage.as_ref(),
            &workflow(Some("busybox:1")),
            Utc::now() + Duration::days(2),
        )
        .await
        .unwrap();

        let manager = StateManager::new(Arc::clone(&storage) as Arc<dyn Storage>);
        manager.start(2).await;
        let triggers = TriggerManager::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::clone(&manager),
        );

        triggers.tick().await;
        assert!(manager.active_states().await.is_empty());
    }

    #[tokio::test]
    async fn registration_initializes_to_first_aligned_instant() {
        let storage = MemStorage::new();
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 5, 30, 0).unwrap();
        register_workflow(&storage, &workflow(Some("busybox:1")), now)
            .await
            .unwrap();

        let rows = storage.workflows_with_next_natural_trigger().await.unwrap();
        assert_eq!(
            rows[0].1,
            Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn re_registration_keeps_the_cursor_unless_partitioning_changes() {
        let storage = MemStorage::new();
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        register_workflow(&storage, &workflow(Some("busybox:1")), now)
            .await
            .unwrap();

        // Same schedule later: cursor untouched.
        let later = now + Duration::days(10);
        register_workflow(&storage, &workflow(Some("busybox:2")), later)
            .await
            .unwrap();
        let rows = storage.workflows_with_next_natural_trigger().await.unwrap();
        assert_eq!(rows[0].1, now);

        // Changed partitioning: cursor re-initialized.
        let hourly = Workflow::new(
            WorkflowId::new("styx", "daily"),
            Schedule::Hours,
            WorkflowConfiguration {
                docker_image: Some("busybox:2".into()),
                ..WorkflowConfiguration::default()
            },
        );
        register_workflow(&storage, &hourly, later).await.unwrap();
        let rows = storage.workflows_with_next_natural_trigger().await.unwrap();
        assert_eq!(rows[0].1, later);
    }
}
