//! In-memory storage for development mode and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use almanac_core::{Backfill, RunState, SequencedEvent, Workflow, WorkflowId, WorkflowInstance};

use crate::error::{Error, Result};
use crate::storage::{ActiveEntry, BackfillFilter, Storage};

/// In-memory [`Storage`] implementation.
///
/// All state lives behind a single mutex, which trivially satisfies the
/// trait's transaction contract. Not durable; a restart loses everything.
#[derive(Debug, Default)]
pub struct MemStorage {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<WorkflowInstance, Vec<SequencedEvent>>,
    active: HashMap<WorkflowInstance, ActiveEntry>,
    workflows: HashMap<WorkflowId, WorkflowRow>,
    backfills: HashMap<String, Backfill>,
    submission_rate: Option<f64>,
}

#[derive(Debug)]
struct WorkflowRow {
    workflow: Workflow,
    next_natural_trigger: Option<DateTime<Utc>>,
    enabled: bool,
}

impl MemStorage {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn check_and_append(&mut self, event: &SequencedEvent, new_state: &RunState) -> Result<()> {
        let stored = self
            .events
            .get(&event.instance)
            .and_then(|log| log.last())
            .map_or(0, |last| last.counter);
        if stored + 1 != event.counter {
            return Err(Error::CounterConflict {
                instance: event.instance.clone(),
                expected: event.counter.saturating_sub(1),
                actual: stored,
            });
        }

        self.events
            .entry(event.instance.clone())
            .or_default()
            .push(event.clone());

        if new_state.state.is_terminal() {
            self.active.remove(&event.instance);
        } else {
            self.active.insert(
                event.instance.clone(),
                ActiveEntry {
                    counter: event.counter,
                    trigger_id: new_state.data.trigger_id.clone(),
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn append_event(&self, event: &SequencedEvent, new_state: &RunState) -> Result<()> {
        self.inner.lock().await.check_and_append(event, new_state)
    }

    async fn append_trigger_event(
        &self,
        event: &SequencedEvent,
        new_state: &RunState,
        backfill: &Backfill,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_and_append(event, new_state)?;
        inner.backfills.insert(backfill.id.clone(), backfill.clone());
        Ok(())
    }

    async fn read_events(&self, instance: &WorkflowInstance) -> Result<Vec<SequencedEvent>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .get(instance)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_counter(&self, instance: &WorkflowInstance) -> Result<Option<u64>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .get(instance)
            .and_then(|log| log.last())
            .map(|last| last.counter))
    }

    async fn read_active_instances(&self) -> Result<HashMap<WorkflowInstance, ActiveEntry>> {
        Ok(self.inner.lock().await.active.clone())
    }

    async fn read_active_instances_for_component(
        &self,
        component: &str,
    ) -> Result<HashMap<WorkflowInstance, ActiveEntry>> {
        Ok(self
            .inner
            .lock()
            .await
            .active
            .iter()
            .filter(|(instance, _)| instance.workflow_id.component == component)
            .map(|(instance, entry)| (instance.clone(), entry.clone()))
            .collect())
    }

    async fn read_active_instances_by_trigger(
        &self,
        trigger_id: &str,
    ) -> Result<HashMap<WorkflowInstance, ActiveEntry>> {
        Ok(self
            .inner
            .lock()
            .await
            .active
            .iter()
            .filter(|(_, entry)| entry.trigger_id.as_deref() == Some(trigger_id))
            .map(|(instance, entry)| (instance.clone(), entry.clone()))
            .collect())
    }

    async fn workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>> {
        Ok(self
            .inner
            .lock()
            .await
            .workflows
            .get(id)
            .map(|row| row.workflow.clone()))
    }

    async fn store_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.workflows.get_mut(&workflow.id) {
            Some(row) => row.workflow = workflow.clone(),
            None => {
                inner.workflows.insert(
                    workflow.id.clone(),
                    WorkflowRow {
                        workflow: workflow.clone(),
                        next_natural_trigger: None,
                        enabled: true,
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete_workflow(&self, id: &WorkflowId) -> Result<()> {
        self.inner.lock().await.workflows.remove(id);
        Ok(())
    }

    async fn workflows_with_next_natural_trigger(
        &self,
    ) -> Result<Vec<(Workflow, DateTime<Utc>)>> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .await
            .workflows
            .values()
            .filter_map(|row| {
                row.next_natural_trigger
                    .map(|next| (row.workflow.clone(), next))
            })
            .collect();
        rows.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn update_next_natural_trigger(
        &self,
        id: &WorkflowId,
        next: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .workflows
            .get_mut(id)
            .ok_or_else(|| Error::WorkflowNotFound(id.clone()))?;
        row.next_natural_trigger = Some(next);
        Ok(())
    }

    async fn is_enabled(&self, id: &WorkflowId) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .workflows
            .get(id)
            .is_some_and(|row| row.enabled))
    }

    async fn set_enabled(&self, id: &WorkflowId, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .workflows
            .get_mut(id)
            .ok_or_else(|| Error::WorkflowNotFound(id.clone()))?;
        row.enabled = enabled;
        Ok(())
    }

    async fn backfill(&self, id: &str) -> Result<Option<Backfill>> {
        Ok(self.inner.lock().await.backfills.get(id).cloned())
    }

    async fn store_backfill(&self, backfill: &Backfill) -> Result<()> {
        self.inner
            .lock()
            .await
            .backfills
            .insert(backfill.id.clone(), backfill.clone());
        Ok(())
    }

    async fn backfills(&self, filter: &BackfillFilter) -> Result<Vec<Backfill>> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .await
            .backfills
            .values()
            .filter(|b| filter.show_all || (!b.halted && !b.all_triggered))
            .filter(|b| {
                filter
                    .component
                    .as_deref()
                    .is_none_or(|c| b.workflow_id.component == c)
            })
            .filter(|b| {
                filter
                    .workflow
                    .as_deref()
                    .is_none_or(|w| b.workflow_id.name == w)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn update_backfill(
        &self,
        id: &str,
        mutate: &(dyn for<'r> Fn(&'r mut Backfill) + Send + Sync),
    ) -> Result<Backfill> {
        let mut inner = self.inner.lock().await;
        let backfill = inner
            .backfills
            .get_mut(id)
            .ok_or_else(|| Error::BackfillNotFound(id.to_string()))?;
        mutate(backfill);
        Ok(backfill.clone())
    }

    async fn submission_rate_limit(&self) -> Result<Option<f64>> {
        Ok(self.inner.lock().await.submission_rate)
    }

    async fn set_submission_rate_limit(&self, permits_per_sec: f64) -> Result<()> {
        self.inner.lock().await.submission_rate = Some(permits_per_sec);
        Ok(())
    }
}
