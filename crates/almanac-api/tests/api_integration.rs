//! API integration tests.
//!
//! Tests the complete request flow: HTTP → routes → backfill engine →
//! storage, against in-memory storage with no background tickers.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use tower::ServiceExt;

use almanac_core::state::TriggerParameters;
use almanac_core::workflow::{Workflow, WorkflowConfiguration};
use almanac_core::{Schedule, WorkflowId, WorkflowInstance};
use almanac_scheduler::backfill::BackfillManager;
use almanac_scheduler::state_manager::StateManager;
use almanac_scheduler::storage::{Storage, memory::MemStorage};

use almanac_api::server::{self, AppState};

struct TestApp {
    storage: Arc<MemStorage>,
    state_manager: Arc<StateManager>,
    backfills: Arc<BackfillManager>,
    router: axum::Router,
}

async fn test_app() -> TestApp {
    let storage = Arc::new(MemStorage::new());
    storage
        .store_workflow(&Workflow::new(
            WorkflowId::new("styx", "daily"),
            Schedule::Days,
            WorkflowConfiguration {
                docker_image: Some("busybox:1".into()),
                ..WorkflowConfiguration::default()
            },
        ))
        .await
        .expect("store workflow");

    let state_manager = StateManager::new(Arc::clone(&storage) as Arc<dyn Storage>);
    state_manager.start(4).await;
    let backfills = Arc::new(BackfillManager::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&state_manager),
    ));

    let state = Arc::new(AppState {
        storage: Arc::clone(&storage) as Arc<dyn Storage>,
        backfills: Arc::clone(&backfills),
        client_blacklist: vec!["styx-cli/0.1".to_string()],
    });

    TestApp {
        storage,
        state_manager,
        backfills,
        router: server::router(state),
    }
}

fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Result<Request<Body>> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let body = match body {
        Some(value) => Body::from(serde_json::to_vec(&value).context("serialize request body")?),
        None => Body::empty(),
    };
    builder.body(body).context("build request")
}

async fn send(
    router: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Result<(StatusCode, serde_json::Value)> {
    let response = router
        .clone()
        .oneshot(request(method, uri, body)?)
        .await
        .unwrap_or_else(|err| match err {});
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 256 * 1024)
        .await
        .context("read response body")?;
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).context("parse response body")?
    };
    Ok((status, value))
}

fn backfill_input() -> serde_json::Value {
    serde_json::json!({
        "component": "styx",
        "workflow": "daily",
        "start": "2020-01-01T00:00:00Z",
        "end": "2020-01-05T00:00:00Z",
        "concurrency": 2
    })
}

#[tokio::test]
async fn create_then_get_backfill() -> Result<()> {
    let app = test_app().await;

    let (status, created) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills",
        Some(backfill_input()),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "create failed: {created}");
    let id = created["id"].as_str().context("created id")?.to_string();
    assert!(id.starts_with("backfill-"));
    assert_eq!(created["nextTrigger"], "2020-01-01T00:00:00Z");
    assert_eq!(created["concurrency"], 2);
    assert_eq!(created["halted"], false);

    // GET includes statuses by default; nothing triggered yet, so every
    // partition is WAITING.
    let (status, payload) =
        send(&app.router, Method::GET, &format!("/api/v3/backfills/{id}"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["backfill"]["id"], id.as_str());
    let rows = payload["statuses"]["activeStates"]
        .as_array()
        .context("status rows")?;
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|row| row["state"] == "WAITING"));

    // status=false omits the rows.
    let (_, payload) = send(
        &app.router,
        Method::GET,
        &format!("/api/v3/backfills/{id}?status=false"),
        None,
    )
    .await?;
    assert!(payload.get("statuses").is_none());

    Ok(())
}

#[tokio::test]
async fn list_filters_by_component_and_show_all() -> Result<()> {
    let app = test_app().await;

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills",
        Some(backfill_input()),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, listed) = send(&app.router, Method::GET, "/api/v3/backfills", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["backfills"].as_array().map(Vec::len), Some(1));

    let (_, listed) = send(
        &app.router,
        Method::GET,
        "/api/v3/backfills?component=other",
        None,
    )
    .await?;
    assert_eq!(listed["backfills"].as_array().map(Vec::len), Some(0));

    Ok(())
}

#[tokio::test]
async fn create_rejects_misaligned_start() -> Result<()> {
    let app = test_app().await;

    let mut input = backfill_input();
    input["start"] = serde_json::json!("2020-01-01T03:15:00Z");
    let (status, body) = send(&app.router, Method::POST, "/api/v3/backfills", Some(input)).await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "start parameter not aligned with schedule");
    Ok(())
}

#[tokio::test]
async fn create_rejects_unknown_workflow() -> Result<()> {
    let app = test_app().await;

    let mut input = backfill_input();
    input["workflow"] = serde_json::json!("nightly");
    let (status, _) = send(&app.router, Method::POST, "/api/v3/backfills", Some(input)).await?;

    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn create_rejects_future_partitions_unless_allowed() -> Result<()> {
    let app = test_app().await;

    let input = serde_json::json!({
        "component": "styx",
        "workflow": "daily",
        "start": "2099-01-01T00:00:00Z",
        "end": "2099-01-05T00:00:00Z",
        "concurrency": 1
    });
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills",
        Some(input.clone()),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "cannot backfill future partitions");

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills?allowFuture=true",
        Some(input),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn create_conflicts_with_active_instances() -> Result<()> {
    let app = test_app().await;

    app.state_manager
        .trigger(
            WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2020-01-03"),
            "natural-other".into(),
            TriggerParameters::default(),
            None,
        )
        .await?;

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills",
        Some(backfill_input()),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(
        body["message"]
            .as_str()
            .is_some_and(|m| m.contains("2020-01-03")),
        "conflict message should list the partition: {body}"
    );
    Ok(())
}

#[tokio::test]
async fn duplicate_create_produces_distinct_ids() -> Result<()> {
    let app = test_app().await;

    let (_, first) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills",
        Some(backfill_input()),
    )
    .await?;
    let (_, second) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills",
        Some(backfill_input()),
    )
    .await?;
    assert_ne!(first["id"], second["id"]);
    Ok(())
}

#[tokio::test]
async fn update_changes_concurrency_and_description_only() -> Result<()> {
    let app = test_app().await;
    let (_, created) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills",
        Some(backfill_input()),
    )
    .await?;
    let id = created["id"].as_str().context("id")?.to_string();

    let (status, updated) = send(
        &app.router,
        Method::PUT,
        &format!("/api/v3/backfills/{id}"),
        Some(serde_json::json!({
            "id": id,
            "concurrency": 5,
            "description": "wider"
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["concurrency"], 5);
    assert_eq!(updated["description"], "wider");
    assert_eq!(updated["start"], created["start"]);

    // Mismatched ids are rejected.
    let (status, body) = send(
        &app.router,
        Method::PUT,
        &format!("/api/v3/backfills/{id}"),
        Some(serde_json::json!({"id": "backfill-other", "concurrency": 1})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "ID of payload does not match ID in uri.");

    let (status, _) = send(
        &app.router,
        Method::PUT,
        "/api/v3/backfills/backfill-missing",
        Some(serde_json::json!({"id": "backfill-missing", "concurrency": 1})),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn halt_flips_the_flag_and_halts_active_instances() -> Result<()> {
    let app = test_app().await;
    let (_, created) = send(
        &app.router,
        Method::POST,
        "/api/v3/backfills",
        Some(backfill_input()),
    )
    .await?;
    let id = created["id"].as_str().context("id")?.to_string();

    // Advance once so two instances are active under the backfill.
    app.backfills.tick().await;
    assert_eq!(app.state_manager.active_states().await.len(), 2);

    let (status, _) = send(
        &app.router,
        Method::DELETE,
        &format!("/api/v3/backfills/{id}"),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let stored = app.storage.backfill(&id).await?.context("stored backfill")?;
    assert!(stored.halted);
    assert!(app.state_manager.active_states().await.is_empty());

    // With free concurrency, further ticks trigger nothing.
    app.backfills.tick().await;
    assert!(app.state_manager.active_states().await.is_empty());

    // Halted backfills only show up with showAll.
    let (_, listed) = send(&app.router, Method::GET, "/api/v3/backfills", None).await?;
    assert_eq!(listed["backfills"].as_array().map(Vec::len), Some(0));
    let (_, listed) = send(
        &app.router,
        Method::GET,
        "/api/v3/backfills?showAll=true",
        None,
    )
    .await?;
    assert_eq!(listed["backfills"].as_array().map(Vec::len), Some(1));

    let (status, _) = send(
        &app.router,
        Method::DELETE,
        "/api/v3/backfills/backfill-missing",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn events_route_returns_the_instance_log() -> Result<()> {
    let app = test_app().await;

    app.state_manager
        .trigger(
            WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2020-01-01"),
            "natural-x".into(),
            TriggerParameters::default(),
            None,
        )
        .await?;

    let (status, body) = send(
        &app.router,
        Method::GET,
        "/api/v3/events/styx/daily/2020-01-01",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().context("events")?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"]["type"], "triggerExecution");
    assert_eq!(events[0]["counter"], 1);

    let (status, _) = send(
        &app.router,
        Method::GET,
        "/api/v3/events/styx/daily/1999-01-01",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn responses_carry_a_request_id() -> Result<()> {
    let app = test_app().await;

    // Inbound ids are echoed.
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/v3/backfills")
                .header("x-request-id", "deadbeef")
                .body(Body::empty())?,
        )
        .await
        .unwrap_or_else(|err| match err {});
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("deadbeef")
    );

    // Otherwise one is minted: a UUID without dashes.
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/v3/backfills")
                .body(Body::empty())?,
        )
        .await
        .unwrap_or_else(|err| match err {});
    let minted = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .context("minted request id")?;
    assert_eq!(minted.len(), 32);
    assert!(minted.chars().all(|c| c.is_ascii_hexdigit()));
    Ok(())
}

#[tokio::test]
async fn blacklisted_clients_are_refused() -> Result<()> {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/v3/backfills")
                .header("user-agent", "styx-cli/0.1")
                .body(Body::empty())?,
        )
        .await
        .unwrap_or_else(|err| match err {});
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/v3/backfills")
                .header("user-agent", "styx-cli/0.2")
                .body(Body::empty())?,
        )
        .await
        .unwrap_or_else(|err| match err {});
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn ping_pongs() -> Result<()> {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/ping")
                .body(Body::empty())?,
        )
        .await
        .unwrap_or_else(|err| match err {});
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await?;
    assert_eq!(&bytes[..], b"pong");
    Ok(())
}
