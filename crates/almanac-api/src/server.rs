//! Router assembly and serving.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Router, middleware};
use tracing::info;

use almanac_scheduler::backfill::BackfillManager;
use almanac_scheduler::storage::Storage;

use crate::context;
use crate::error::ApiError;

/// Shared state of the HTTP surface.
pub struct AppState {
    /// The storage the engine runs against.
    pub storage: Arc<dyn Storage>,
    /// The backfill manager.
    pub backfills: Arc<BackfillManager>,
    /// User-Agent values refused by the middleware.
    pub client_blacklist: Vec<String>,
}

/// Builds the full application router with middleware applied.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    let api = crate::routes::backfills::router().merge(crate::routes::events::router());

    Router::new()
        .nest("/api/v3", api)
        .route("/ping", get(ping))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            context::request_middleware,
        ))
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

/// Binds and serves the router until the shutdown future resolves.
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn serve(
    router: Router,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ApiError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "management surface listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::internal(format!("server error: {e}")))
}
