//! Event log read routes.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Extension, Path, State};
use axum::routing::get;

use almanac_core::{WorkflowId, WorkflowInstance};

use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::payloads::EventsPayload;
use crate::server::AppState;

/// Builds the events router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/events/:component/:workflow/:parameter",
        get(get_instance_events),
    )
}

/// Returns an instance's logged events in counter order, for diagnostics.
async fn get_instance_events(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((component, workflow, parameter)): Path<(String, String, String)>,
) -> ApiResult<Json<EventsPayload>> {
    let instance = WorkflowInstance::new(WorkflowId::new(component, workflow), parameter);
    let events = state
        .storage
        .read_events(&instance)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    if events.is_empty() {
        return Err(ApiError::not_found("no events found for workflow instance")
            .with_request_id(ctx.request_id.clone()));
    }
    Ok(Json(EventsPayload { events }))
}
