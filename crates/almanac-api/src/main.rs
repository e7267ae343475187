//! The almanac scheduler service.
//!
//! Assembles the engine and serves the management surface. Development mode
//! runs against in-memory storage with a simulated container runner;
//! production mode requires the external storage and runner adapters, which
//! are wired in the deployment build.

use std::sync::Arc;

use tracing::info;

use almanac_core::observability::{LogFormat, init_logging};
use almanac_scheduler::handlers::NoopPublisher;
use almanac_scheduler::runner::{DockerRunner, LocalDockerRunner};
use almanac_scheduler::runtime::Runtime;
use almanac_scheduler::storage::{Storage, memory::MemStorage};
use almanac_scheduler::{Error, SchedulerConfig};

use almanac_api::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env());

    let config = SchedulerConfig::from_env()?;
    if !config.is_dev_mode() {
        return Err(Box::new(Error::configuration(
            "production storage and runner adapters are wired in the deployment build; \
             set ALMANAC_MODE=development to run standalone",
        )) as Box<dyn std::error::Error>);
    }

    info!("running in development mode with in-memory storage");
    let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());

    let runtime = Runtime::start(
        &config,
        Arc::clone(&storage),
        |sink| Arc::new(LocalDockerRunner::new(sink)) as Arc<dyn DockerRunner>,
        Arc::new(NoopPublisher),
    )
    .await?;

    let state = Arc::new(AppState {
        storage,
        backfills: Arc::clone(&runtime.backfills),
        client_blacklist: config.client_blacklist.clone(),
    });
    let router = server::router(state);

    server::serve(router, config.http_port, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    runtime.shutdown().await;
    Ok(())
}
