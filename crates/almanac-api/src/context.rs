//! Request context and middleware.
//!
//! Every request gets a [`RequestContext`] carrying its request id: the
//! inbound `X-Request-Id` header when present, else a freshly minted dashless
//! UUID. The id is echoed on every response and embedded in internal error
//! reasons. Blacklisted client versions are refused before any handler runs.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request ID for tracing and correlation.
    pub request_id: String,
}

/// Request middleware: assigns the request id, refuses blacklisted clients,
/// and stamps `X-Request-Id` on the response.
pub async fn request_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers(request.headers())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    if let Some(agent) = header_string(request.headers(), "user-agent") {
        if state.client_blacklist.contains(&agent) {
            return stamp_request_id(
                ApiError::not_acceptable("blacklisted client version, please upgrade")
                    .with_request_id(request_id.clone())
                    .into_response(),
                &request_id,
            );
        }
    }

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
    });

    let response = next.run(request).await;
    stamp_request_id(response, &request_id)
}

fn stamp_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, REQUEST_ID_HEADER)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
