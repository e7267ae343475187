//! Backfill CRUD and halt routes.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use almanac_core::{Backfill, WorkflowId};
use almanac_scheduler::backfill::CreateBackfillRequest;
use almanac_scheduler::storage::BackfillFilter;

use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::payloads::{
    BackfillInput, BackfillPayload, BackfillsPayload, CreateParams, EditableBackfillInput,
    GetParams, ListParams, RunStateData, RunStateDataPayload,
};
use crate::server::AppState;

/// Builds the backfill router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/backfills", get(list_backfills).post(create_backfill))
        .route(
            "/backfills/:id",
            get(get_backfill).put(update_backfill).delete(halt_backfill),
        )
}

async fn list_backfills(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<BackfillsPayload>> {
    let filter = BackfillFilter {
        show_all: params.show_all.unwrap_or(false),
        component: params.component,
        workflow: params.workflow,
    };
    let backfills = state
        .storage
        .backfills(&filter)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let include_statuses = params.status.unwrap_or(false);
    let mut payloads = Vec::with_capacity(backfills.len());
    for backfill in backfills {
        payloads.push(backfill_payload(&state, &ctx, backfill, include_statuses).await?);
    }
    Ok(Json(BackfillsPayload {
        backfills: payloads,
    }))
}

async fn create_backfill(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<CreateParams>,
    Json(input): Json<BackfillInput>,
) -> ApiResult<Json<Backfill>> {
    let request = CreateBackfillRequest {
        workflow_id: WorkflowId::new(input.component, input.workflow),
        start: input.start,
        end: input.end,
        concurrency: input.concurrency,
        description: input.description,
        reverse: input.reverse,
        trigger_parameters: input.trigger_parameters,
        allow_future: params.allow_future.unwrap_or(false),
    };
    let backfill = state
        .backfills
        .create(request, Utc::now())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(backfill))
}

async fn get_backfill(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(params): Query<GetParams>,
) -> ApiResult<Json<BackfillPayload>> {
    let backfill = state
        .storage
        .backfill(&id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?
        .ok_or_else(|| {
            ApiError::not_found("backfill not found").with_request_id(ctx.request_id.clone())
        })?;

    let include_statuses = params.status.unwrap_or(true);
    let payload = backfill_payload(&state, &ctx, backfill, include_statuses).await?;
    Ok(Json(payload))
}

async fn update_backfill(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(input): Json<EditableBackfillInput>,
) -> ApiResult<Json<Backfill>> {
    if input.id != id {
        return Err(
            ApiError::bad_request("ID of payload does not match ID in uri.")
                .with_request_id(ctx.request_id.clone()),
        );
    }
    let backfill = state
        .backfills
        .update(&id, input.concurrency, input.description)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(backfill))
}

/// Halts the backfill. The halted flag flip is durable even when some
/// instances cannot be halted; partial failures surface as a 500 with a
/// reason.
async fn halt_backfill(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let outcome = state
        .backfills
        .halt(&id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    if outcome.failed.is_empty() {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(ApiError::internal(
            "some active instances cannot be halted, however no new ones will be triggered",
        )
        .with_request_id(ctx.request_id.clone()))
    }
}

async fn backfill_payload(
    state: &AppState,
    ctx: &RequestContext,
    backfill: Backfill,
    include_statuses: bool,
) -> ApiResult<BackfillPayload> {
    let statuses = if include_statuses {
        let rows = state
            .backfills
            .status(&backfill)
            .await
            .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
        Some(RunStateDataPayload {
            active_states: rows.into_iter().map(RunStateData::from).collect(),
        })
    } else {
        None
    };
    Ok(BackfillPayload { backfill, statuses })
}
