//! The queued, event-serialized state manager.
//!
//! All state movement funnels through [`StateManager::receive`] (events for
//! active instances) and [`StateManager::trigger`] (the first event of a
//! run). Requests are hashed onto a fixed set of shard workers; each shard is
//! a single task, so events for one instance apply in arrival order while
//! distinct instances proceed in parallel.
//!
//! A shard worker applies an event by:
//!
//! 1. reading the authoritative in-memory [`RunState`]
//! 2. computing the next state through the pure transition function
//! 3. appending the event to the log with the optimistic counter; on a
//!    counter conflict the instance is reloaded from the log and the event
//!    retried once
//! 4. swapping the new state into the in-memory map (terminal states are
//!    removed; the storage append already cleared their index row)
//! 5. fanning out to the output handlers on a separate task, so handler
//!    latency cannot stall the shard
//!
//! Once `receive` resolves, the event is durably logged, the in-memory state
//! reflects it, and the output handlers have been scheduled.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, warn};

use almanac_core::observability::instance_span;
use almanac_core::state::TriggerParameters;
use almanac_core::{Backfill, Event, RunState, SequencedEvent, WorkflowId, WorkflowInstance};

use crate::error::{Error, Result};
use crate::handlers::OutputHandler;
use crate::metrics::{labels, names};
use crate::storage::Storage;

/// Default number of shard workers.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Capacity of each shard's request queue.
const SHARD_QUEUE_DEPTH: usize = 1024;

/// How long `close` waits for shards to drain.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const PHASE_LOADING: u8 = 0;
const PHASE_OPEN: u8 = 1;
const PHASE_CLOSED: u8 = 2;

/// Sink for events posted back into the state machine.
///
/// Output handlers and runner adapters hold the state manager through this
/// trait, which breaks the construction cycle between the manager and its
/// handlers: handlers post events, they never mutate state.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Submits an event for an active workflow instance.
    async fn receive(&self, instance: &WorkflowInstance, event: Event) -> Result<()>;
}

enum Request {
    Receive {
        instance: WorkflowInstance,
        event: Event,
        reply: oneshot::Sender<Result<()>>,
    },
    Trigger {
        instance: WorkflowInstance,
        trigger_id: String,
        parameters: TriggerParameters,
        backfill: Option<Backfill>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// The queued, sharded state machine driver.
pub struct StateManager {
    storage: Arc<dyn Storage>,
    states: Arc<RwLock<HashMap<WorkflowInstance, RunState>>>,
    handlers: RwLock<Arc<[Arc<dyn OutputHandler>]>>,
    shards: Mutex<Vec<mpsc::Sender<Request>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    phase: AtomicU8,
}

impl StateManager {
    /// Creates a state manager in the loading phase.
    ///
    /// Attach output handlers and restore replayed states, then call
    /// [`StateManager::start`].
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            states: Arc::new(RwLock::new(HashMap::new())),
            handlers: RwLock::new(Arc::from(Vec::new())),
            shards: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            phase: AtomicU8::new(PHASE_LOADING),
        })
    }

    /// Attaches the ordered output handler chain.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IsClosed`] once the manager is open.
    pub async fn set_output_handlers(&self, handlers: Vec<Arc<dyn OutputHandler>>) -> Result<()> {
        if self.phase.load(Ordering::Acquire) != PHASE_LOADING {
            return Err(Error::IsClosed);
        }
        *self.handlers.write().await = Arc::from(handlers);
        Ok(())
    }

    /// Seeds the in-memory map with replayed states.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IsClosed`] once the manager is open.
    pub async fn restore(&self, states: HashMap<WorkflowInstance, RunState>) -> Result<()> {
        if self.phase.load(Ordering::Acquire) != PHASE_LOADING {
            return Err(Error::IsClosed);
        }
        self.states.write().await.extend(states);
        Ok(())
    }

    /// Opens the manager: spawns the shard workers and starts accepting
    /// events.
    pub async fn start(self: &Arc<Self>, shard_count: usize) {
        let shard_count = shard_count.max(1);
        let handlers = Arc::clone(&*self.handlers.read().await);

        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(SHARD_QUEUE_DEPTH);
            senders.push(tx);
            workers.push(tokio::spawn(run_shard(
                shard,
                rx,
                Arc::clone(&self.storage),
                Arc::clone(&self.states),
                Arc::clone(&handlers),
            )));
        }

        *self.shards.lock().await = senders;
        *self.workers.lock().await = workers;
        self.phase.store(PHASE_OPEN, Ordering::Release);
    }

    /// Starts a run: creates the fresh state and applies `triggerExecution`.
    ///
    /// When `backfill` is supplied the event append also persists the
    /// advanced backfill row in the same storage transaction.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadyActive`] if the instance is already
    /// running, [`Error::IsClosed`] if the manager is not open, or a storage
    /// error.
    pub async fn trigger(
        &self,
        instance: WorkflowInstance,
        trigger_id: String,
        parameters: TriggerParameters,
        backfill: Option<Backfill>,
    ) -> Result<()> {
        self.submit(|reply| Request::Trigger {
            instance,
            trigger_id,
            parameters,
            backfill,
            reply,
        })
        .await
    }

    /// Returns an immutable snapshot of all active run states.
    pub async fn active_states(&self) -> HashMap<WorkflowInstance, RunState> {
        self.states.read().await.clone()
    }

    /// Returns the number of active instances of one workflow.
    pub async fn active_count_for(&self, workflow_id: &WorkflowId) -> usize {
        self.states
            .read()
            .await
            .keys()
            .filter(|instance| &instance.workflow_id == workflow_id)
            .count()
    }

    /// Closes the manager: rejects further events and drains the shard
    /// queues within a bounded grace period.
    pub async fn close(&self) {
        self.phase.store(PHASE_CLOSED, Ordering::Release);
        self.shards.lock().await.clear();

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if tokio::time::timeout(CLOSE_GRACE, worker).await.is_err() {
                warn!("state-manager shard did not drain within the close grace period");
            }
        }
    }

    async fn submit<F>(&self, request: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Request,
    {
        if self.phase.load(Ordering::Acquire) != PHASE_OPEN {
            return Err(Error::IsClosed);
        }

        let (reply, response) = oneshot::channel();
        let request = request(reply);
        let sender = {
            let shards = self.shards.lock().await;
            if shards.is_empty() {
                return Err(Error::IsClosed);
            }
            let index = shard_index(request_instance(&request), shards.len());
            shards[index].clone()
        };

        metrics::gauge!(names::QUEUED_EVENTS).increment(1.0);
        if sender.send(request).await.is_err() {
            metrics::gauge!(names::QUEUED_EVENTS).decrement(1.0);
            return Err(Error::IsClosed);
        }
        response.await.map_err(|_| Error::IsClosed)?
    }
}

#[async_trait]
impl EventSink for StateManager {
    async fn receive(&self, instance: &WorkflowInstance, event: Event) -> Result<()> {
        let instance = instance.clone();
        self.submit(|reply| Request::Receive {
            instance,
            event,
            reply,
        })
        .await
    }
}

fn request_instance(request: &Request) -> &WorkflowInstance {
    match request {
        Request::Receive { instance, .. } | Request::Trigger { instance, .. } => instance,
    }
}

fn shard_index(instance: &WorkflowInstance, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    instance.hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)]
    {
        hasher.finish() as usize % shard_count
    }
}

async fn run_shard(
    shard: usize,
    mut requests: mpsc::Receiver<Request>,
    storage: Arc<dyn Storage>,
    states: Arc<RwLock<HashMap<WorkflowInstance, RunState>>>,
    handlers: Arc<[Arc<dyn OutputHandler>]>,
) {
    while let Some(request) = requests.recv().await {
        metrics::gauge!(names::QUEUED_EVENTS).decrement(1.0);
        match request {
            Request::Receive {
                instance,
                event,
                reply,
            } => {
                let result =
                    apply_event(storage.as_ref(), &states, &handlers, &instance, &event).await;
                let _ = reply.send(result);
            }
            Request::Trigger {
                instance,
                trigger_id,
                parameters,
                backfill,
                reply,
            } => {
                let result = apply_trigger(
                    storage.as_ref(),
                    &states,
                    &handlers,
                    instance,
                    trigger_id,
                    parameters,
                    backfill,
                )
                .await;
                let _ = reply.send(result);
            }
        }
    }
    debug!(shard, "state-manager shard drained");
}

async fn apply_event(
    storage: &dyn Storage,
    states: &RwLock<HashMap<WorkflowInstance, RunState>>,
    handlers: &Arc<[Arc<dyn OutputHandler>]>,
    instance: &WorkflowInstance,
    event: &Event,
) -> Result<()> {
    let current = states
        .read()
        .await
        .get(instance)
        .cloned()
        .ok_or_else(|| Error::NotActive {
            instance: instance.clone(),
        })?;

    let next = match persist(storage, &current, event).await {
        Ok(next) => next,
        Err(Error::CounterConflict {
            expected, actual, ..
        }) => {
            // The in-memory state lost a race against the log; reload the
            // authoritative state and retry once.
            warn!(
                instance = %instance,
                expected,
                actual,
                "counter conflict, reloading from log and retrying"
            );
            let reloaded = crate::replay::replay_instance(storage, instance)
                .await?
                .ok_or_else(|| Error::NotActive {
                    instance: instance.clone(),
                })?;
            persist(storage, &reloaded, event).await?
        }
        Err(error) => return Err(error),
    };

    commit(states, handlers, next).await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn apply_trigger(
    storage: &dyn Storage,
    states: &RwLock<HashMap<WorkflowInstance, RunState>>,
    handlers: &Arc<[Arc<dyn OutputHandler>]>,
    instance: WorkflowInstance,
    trigger_id: String,
    parameters: TriggerParameters,
    backfill: Option<Backfill>,
) -> Result<()> {
    if states.read().await.contains_key(&instance) {
        return Err(Error::AlreadyActive { instance });
    }

    let now = Utc::now();
    let base_counter = storage.latest_counter(&instance).await?.unwrap_or(0);
    let fresh = RunState::fresh(instance.clone(), base_counter, now);
    let event = Event::TriggerExecution {
        trigger_id,
        parameters,
    };
    let next = fresh.transition(&event, now)?;
    let sequenced = SequencedEvent {
        instance: instance.clone(),
        counter: next.counter,
        timestamp: now,
        event,
    };

    match backfill {
        Some(backfill) => {
            storage
                .append_trigger_event(&sequenced, &next, &backfill)
                .await?;
        }
        None => storage.append_event(&sequenced, &next).await?,
    }

    commit(states, handlers, next).await;
    Ok(())
}

/// Transitions and durably appends; the new state is only returned once the
/// event is logged.
async fn persist(storage: &dyn Storage, current: &RunState, event: &Event) -> Result<RunState> {
    let now = Utc::now();
    let next = current.transition(event, now)?;
    let sequenced = SequencedEvent {
        instance: next.instance.clone(),
        counter: next.counter,
        timestamp: now,
        event: event.clone(),
    };
    storage.append_event(&sequenced, &next).await?;
    Ok(next)
}

async fn commit(
    states: &RwLock<HashMap<WorkflowInstance, RunState>>,
    handlers: &Arc<[Arc<dyn OutputHandler>]>,
    next: RunState,
) {
    {
        let mut map = states.write().await;
        if next.state.is_terminal() {
            map.remove(&next.instance);
        } else {
            map.insert(next.instance.clone(), next.clone());
        }
    }
    dispatch_handlers(handlers, next);
}

/// Runs the handler chain on its own task, in declared order, isolating
/// failures per handler.
fn dispatch_handlers(handlers: &Arc<[Arc<dyn OutputHandler>]>, state: RunState) {
    if handlers.is_empty() {
        return;
    }
    let handlers = Arc::clone(handlers);
    let span = instance_span("output_handlers", &state.instance);
    tokio::spawn(
        async move {
            for handler in handlers.iter() {
                if let Err(error) = handler.transition_into(&state).await {
                    warn!(
                        handler = handler.name(),
                        state = %state.state,
                        error = %error,
                        "output handler failed"
                    );
                    metrics::counter!(
                        names::HANDLER_FAILURES_TOTAL,
                        labels::HANDLER => handler.name()
                    )
                    .increment(1);
                }
            }
        }
        .instrument(span),
    );
}
