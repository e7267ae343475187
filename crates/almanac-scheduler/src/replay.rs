//! Replay-from-log recovery.
//!
//! The event log is the single source of truth. Folding an instance's events
//! through the pure transition function reconstructs its state; this module
//! is how the engine recovers after a restart and how backfill status reads
//! reconstruct historical outcomes.
//!
//! Replay is deterministic: events are applied with their logged timestamps,
//! so folding any prefix and then the remaining suffix reaches the same
//! states as folding the whole log.

use std::collections::HashMap;

use tracing::warn;

use almanac_core::{Event, RunState, WorkflowInstance};

use crate::error::Result;
use crate::storage::Storage;

/// Reconstructs an instance's state by folding its event log.
///
/// Returns `None` if the instance has no events. A log may span several runs
/// of the same partition (a backfill re-running an old instance); a trigger
/// event following a terminal state starts a fresh fold that continues the
/// counter sequence.
///
/// # Errors
///
/// Returns an error if storage fails or the log does not fold (a corrupt or
/// manually edited log).
pub async fn replay_instance(
    storage: &dyn Storage,
    instance: &WorkflowInstance,
) -> Result<Option<RunState>> {
    let events = storage.read_events(instance).await?;
    let Some(first) = events.first() else {
        return Ok(None);
    };

    let mut state = RunState::fresh(
        instance.clone(),
        first.counter.saturating_sub(1),
        first.timestamp,
    );
    for sequenced in &events {
        if state.state.is_terminal() && is_trigger(&sequenced.event) {
            state = RunState::fresh(
                instance.clone(),
                sequenced.counter.saturating_sub(1),
                sequenced.timestamp,
            );
        }
        state = state.transition(&sequenced.event, sequenced.timestamp)?;
    }
    Ok(Some(state))
}

/// Rebuilds the in-memory state map for every instance in the
/// active-instance index.
///
/// Instances whose log fails to fold are skipped with a warning rather than
/// aborting the boot; the index row is left in place for manual inspection.
///
/// # Errors
///
/// Returns an error if the index itself cannot be read.
pub async fn replay_active_states(
    storage: &dyn Storage,
) -> Result<HashMap<WorkflowInstance, RunState>> {
    let active = storage.read_active_instances().await?;
    let mut states = HashMap::with_capacity(active.len());

    for (instance, entry) in active {
        match replay_instance(storage, &instance).await {
            Ok(Some(state)) => {
                if state.counter != entry.counter {
                    warn!(
                        instance = %instance,
                        replayed = state.counter,
                        indexed = entry.counter,
                        "active-instance index counter does not match replayed log"
                    );
                }
                if state.state.is_terminal() {
                    warn!(
                        instance = %instance,
                        state = %state.state,
                        "active-instance index points at a terminal state, skipping"
                    );
                    continue;
                }
                states.insert(instance, state);
            }
            Ok(None) => {
                warn!(instance = %instance, "active instance has no events, skipping");
            }
            Err(error) => {
                warn!(instance = %instance, error = %error, "failed to replay instance, skipping");
            }
        }
    }
    Ok(states)
}

/// Reconstructs the last known state of a backfill's instance, if its latest
/// run was started by the given trigger.
///
/// # Errors
///
/// Returns an error if storage fails.
pub async fn backfill_run_state(
    storage: &dyn Storage,
    instance: &WorkflowInstance,
    trigger_id: &str,
) -> Result<Option<RunState>> {
    let state = replay_instance(storage, instance).await.unwrap_or_else(|error| {
        warn!(instance = %instance, error = %error, "failed to replay instance for backfill status");
        None
    });
    Ok(state.filter(|s| s.data.trigger_id.as_deref() == Some(trigger_id)))
}

fn is_trigger(event: &Event) -> bool {
    matches!(event, Event::TriggerExecution { .. } | Event::TimeTrigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use almanac_core::state::{ExecutionDescription, State, TriggerParameters};
    use almanac_core::{RunState, SequencedEvent, WorkflowId};
    use chrono::Utc;

    use crate::storage::memory::MemStorage;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2020-01-01")
    }

    async fn append(storage: &MemStorage, state: RunState, event: Event) -> RunState {
        let now = Utc::now();
        let next = state.transition(&event, now).unwrap();
        let sequenced = SequencedEvent {
            instance: next.instance.clone(),
            counter: next.counter,
            timestamp: now,
            event,
        };
        storage.append_event(&sequenced, &next).await.unwrap();
        next
    }

    fn trigger(id: &str) -> Event {
        Event::TriggerExecution {
            trigger_id: id.into(),
            parameters: TriggerParameters::default(),
        }
    }

    #[tokio::test]
    async fn replay_reaches_the_live_state() {
        let storage = MemStorage::new();
        let instance = instance();
        let mut state = RunState::fresh(instance.clone(), 0, Utc::now());
        state = append(&storage, state, trigger("backfill-1")).await;
        state = append(&storage, state, Event::Dequeue).await;
        state = append(
            &storage,
            state,
            Event::Submit {
                description: ExecutionDescription {
                    docker_image: "busybox:1".into(),
                    docker_args: vec![],
                },
            },
        )
        .await;

        let replayed = replay_instance(&storage, &instance).await.unwrap().unwrap();
        assert_eq!(replayed.state, state.state);
        assert_eq!(replayed.counter, state.counter);
        assert_eq!(replayed.data, state.data);
    }

    #[tokio::test]
    async fn replay_spans_a_re_triggered_partition() {
        let storage = MemStorage::new();
        let instance = instance();

        // First run ends in DONE via halt.
        let mut state = RunState::fresh(instance.clone(), 0, Utc::now());
        state = append(&storage, state, trigger("natural-1")).await;
        state = append(&storage, state, Event::Halt).await;
        assert_eq!(state.state, State::Done);

        // A backfill re-runs the partition, continuing the counter sequence.
        let fresh = RunState::fresh(instance.clone(), state.counter, Utc::now());
        let requeued = append(&storage, fresh, trigger("backfill-2")).await;
        assert_eq!(requeued.counter, 3);

        let replayed = replay_instance(&storage, &instance).await.unwrap().unwrap();
        assert_eq!(replayed.state, State::Queued);
        assert_eq!(replayed.counter, 3);
        assert_eq!(replayed.data.trigger_id.as_deref(), Some("backfill-2"));
    }

    #[tokio::test]
    async fn replay_active_states_rebuilds_only_live_instances() {
        let storage = MemStorage::new();
        let live = instance();
        let finished =
            WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2020-01-02");

        let state = RunState::fresh(live.clone(), 0, Utc::now());
        append(&storage, state, trigger("backfill-1")).await;

        let mut other = RunState::fresh(finished.clone(), 0, Utc::now());
        other = append(&storage, other, trigger("backfill-1")).await;
        append(&storage, other, Event::Halt).await;

        let states = replay_active_states(&storage).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[&live].state, State::Queued);
    }

    #[tokio::test]
    async fn backfill_run_state_filters_on_trigger_id() {
        let storage = MemStorage::new();
        let instance = instance();
        let state = RunState::fresh(instance.clone(), 0, Utc::now());
        append(&storage, state, trigger("backfill-1")).await;

        let matching = backfill_run_state(&storage, &instance, "backfill-1")
            .await
            .unwrap();
        assert!(matching.is_some());

        let other = backfill_run_state(&storage, &instance, "backfill-2")
            .await
            .unwrap();
        assert!(other.is_none());

        let no_events = backfill_run_state(
            &storage,
            &WorkflowInstance::new(WorkflowId::new("styx", "daily"), "1999-01-01"),
            "backfill-1",
        )
        .await
        .unwrap();
        assert!(no_events.is_none());
    }
}
