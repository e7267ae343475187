//! Engine assembly and lifecycle.
//!
//! [`Runtime::start`] wires the engine together in dependency order: replay
//! and restore, the state manager with its handler chain, and the three
//! periodic tickers (scheduler, triggers + backfills, runtime-config
//! refresh). [`Runtime::shutdown`] stops the tickers and drains the state
//! manager, in that order, on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use almanac_core::retry::RetryPolicy;

use crate::backfill::BackfillManager;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::handlers::{
    DockerRunnerHandler, ExecutionDescriptionHandler, MonitoringHandler, OutputHandler,
    Publisher, PublisherHandler, TerminationHandler, TransitionLogger,
};
use crate::rate_limit::SubmissionRateLimiter;
use crate::replay;
use crate::runner::DockerRunner;
use crate::scheduler::Scheduler;
use crate::state_manager::{EventSink, StateManager};
use crate::storage::Storage;
use crate::trigger::TriggerManager;

/// A running engine: the state manager, the backfill manager, and the
/// background tickers.
pub struct Runtime {
    /// The storage the engine runs against.
    pub storage: Arc<dyn Storage>,
    /// The state manager.
    pub state_manager: Arc<StateManager>,
    /// The backfill manager (shared with the HTTP surface).
    pub backfills: Arc<BackfillManager>,
    /// The global submission rate limiter.
    pub rate_limiter: Arc<SubmissionRateLimiter>,
    shutdown: watch::Sender<bool>,
    tickers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Assembles and starts the engine.
    ///
    /// `make_runner` receives the event sink so runner adapters can post
    /// lifecycle events back into the state machine.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid or boot-time replay
    /// fails.
    pub async fn start<F>(
        config: &SchedulerConfig,
        storage: Arc<dyn Storage>,
        make_runner: F,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self>
    where
        F: FnOnce(Arc<dyn EventSink>) -> Arc<dyn DockerRunner>,
    {
        let ttls = config.timeout_config()?;
        let rate_limiter = Arc::new(SubmissionRateLimiter::new(config.submission_rate_per_sec));

        let state_manager = StateManager::new(Arc::clone(&storage));
        let sink: Arc<dyn EventSink> = Arc::clone(&state_manager) as Arc<dyn EventSink>;
        let runner = make_runner(Arc::clone(&sink));

        let handlers: Vec<Arc<dyn OutputHandler>> = vec![
            Arc::new(TransitionLogger),
            Arc::new(ExecutionDescriptionHandler::new(
                Arc::clone(&storage),
                Arc::clone(&sink),
            )),
            Arc::new(DockerRunnerHandler::new(
                runner,
                Arc::clone(&sink),
                Arc::clone(&rate_limiter),
            )),
            Arc::new(TerminationHandler::new(
                RetryPolicy::default(),
                Arc::clone(&sink),
            )),
            Arc::new(PublisherHandler::new(publisher)),
            Arc::new(MonitoringHandler),
        ];
        state_manager.set_output_handlers(handlers).await?;

        let restored = replay::replay_active_states(storage.as_ref()).await?;
        if !restored.is_empty() {
            info!(count = restored.len(), "restored active instances from the event log");
        }
        state_manager.restore(restored).await?;
        state_manager.start(config.shard_count).await;

        let scheduler = Scheduler::new(Arc::clone(&state_manager), ttls);
        let trigger_manager = Arc::new(TriggerManager::new(
            Arc::clone(&storage),
            Arc::clone(&state_manager),
        ));
        let backfills = Arc::new(BackfillManager::new(
            Arc::clone(&storage),
            Arc::clone(&state_manager),
        ));

        let (shutdown, _) = watch::channel(false);
        let mut tickers = Vec::new();

        {
            let scheduler = Arc::new(scheduler);
            let rx = shutdown.subscribe();
            tickers.push(spawn_ticker(
                "scheduler",
                config.scheduler_tick_interval(),
                rx,
                move || {
                    let scheduler = Arc::clone(&scheduler);
                    async move { scheduler.tick().await }
                },
            ));
        }
        {
            let trigger_manager = Arc::clone(&trigger_manager);
            let rx = shutdown.subscribe();
            tickers.push(spawn_ticker(
                "trigger-manager",
                config.trigger_tick_interval(),
                rx,
                move || {
                    let trigger_manager = Arc::clone(&trigger_manager);
                    async move { trigger_manager.tick().await }
                },
            ));
        }
        {
            let backfills = Arc::clone(&backfills);
            let rx = shutdown.subscribe();
            tickers.push(spawn_ticker(
                "backfill",
                config.trigger_tick_interval(),
                rx,
                move || {
                    let backfills = Arc::clone(&backfills);
                    async move { backfills.tick().await }
                },
            ));
        }
        {
            let storage = Arc::clone(&storage);
            let rate_limiter = Arc::clone(&rate_limiter);
            let rx = shutdown.subscribe();
            tickers.push(spawn_ticker(
                "runtime-config",
                config.runtime_config_interval(),
                rx,
                move || {
                    let storage = Arc::clone(&storage);
                    let rate_limiter = Arc::clone(&rate_limiter);
                    async move { refresh_runtime_config(storage.as_ref(), &rate_limiter).await }
                },
            ));
        }

        Ok(Self {
            storage,
            state_manager,
            backfills,
            rate_limiter,
            shutdown,
            tickers,
        })
    }

    /// Stops the tickers and drains the state manager.
    pub async fn shutdown(self) {
        info!("shutting down the scheduler engine");
        let _ = self.shutdown.send(true);
        for ticker in self.tickers {
            if ticker.await.is_err() {
                warn!("ticker task failed during shutdown");
            }
        }
        self.state_manager.close().await;
    }
}

/// Spawns a non-overlapping ticker. A tick that runs long delays, never
/// compounds, the next one.
fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => {
                    info!(ticker = name, "ticker stopped");
                    return;
                }
            }
        }
    })
}

/// Re-reads the global submission rate from storage.
async fn refresh_runtime_config(storage: &dyn Storage, rate_limiter: &SubmissionRateLimiter) {
    match storage.submission_rate_limit().await {
        Ok(Some(rate)) => rate_limiter.set_rate(rate).await,
        Ok(None) => {}
        Err(error) => {
            warn!(error = %error, "failed to read submission rate, keeping the current limit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use almanac_core::workflow::{Workflow, WorkflowConfiguration};
    use almanac_core::{Schedule, WorkflowId};

    use crate::handlers::NoopPublisher;
    use crate::runner::LocalDockerRunner;
    use crate::storage::memory::MemStorage;
    use crate::trigger::register_workflow;

    fn dev_config() -> SchedulerConfig {
        SchedulerConfig {
            scheduler_tick_interval_secs: 1,
            trigger_tick_interval_secs: 1,
            runtime_config_interval_secs: 1,
            shard_count: 4,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn runtime_starts_and_shuts_down() {
        let storage = Arc::new(MemStorage::new());
        let runtime = Runtime::start(
            &dev_config(),
            storage,
            |sink| {
                Arc::new(LocalDockerRunner::with_delays(
                    sink,
                    Duration::from_millis(1),
                    Duration::from_millis(1),
                )) as Arc<dyn DockerRunner>
            },
            Arc::new(NoopPublisher),
        )
        .await
        .unwrap();

        assert!(runtime.state_manager.active_states().await.is_empty());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn runtime_config_refresh_applies_the_stored_rate() {
        let storage = Arc::new(MemStorage::new());
        storage.set_submission_rate_limit(42.0).await.unwrap();

        let rate_limiter = SubmissionRateLimiter::new(1000.0);
        refresh_runtime_config(storage.as_ref(), &rate_limiter).await;
        assert!((rate_limiter.rate().await - 42.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn end_to_end_natural_trigger_runs_to_done() {
        let storage = Arc::new(MemStorage::new());
        let workflow = Workflow::new(
            WorkflowId::new("styx", "daily"),
            Schedule::Days,
            WorkflowConfiguration {
                docker_image: Some("busybox:1".into()),
                ..WorkflowConfiguration::default()
            },
        );
        // Register in the past so a partition is already due.
        let registered_at = chrono::Utc::now() - chrono::Duration::days(1);
        register_workflow(storage.as_ref(), &workflow, registered_at)
            .await
            .unwrap();
        let due_partition = workflow
            .schedule
            .first_instant_at_or_after(registered_at)
            .unwrap();
        let due_instance = almanac_core::WorkflowInstance::new(
            workflow.id.clone(),
            workflow.schedule.to_parameter(due_partition),
        );

        let runtime = Runtime::start(
            &dev_config(),
            Arc::clone(&storage) as Arc<dyn Storage>,
            |sink| {
                Arc::new(LocalDockerRunner::with_delays(
                    sink,
                    Duration::from_millis(1),
                    Duration::from_millis(1),
                )) as Arc<dyn DockerRunner>
            },
            Arc::new(NoopPublisher),
        )
        .await
        .unwrap();

        // Within a few ticks the due partition is triggered, dequeued,
        // submitted to the simulated runner and completed.
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(10);
        loop {
            let triggered = !storage.read_events(&due_instance).await.unwrap().is_empty();
            let active = storage.read_active_instances().await.unwrap();
            if triggered && !active.contains_key(&due_instance) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "instance did not complete in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        runtime.shutdown().await;
    }
}
