//! End-to-end tests of the HTTP boundary
//!
//! Requests go through the full router (CORS, tracing, correlation IDs) into
//! an engine whose rules answer the requesting route.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use concept_sync_core::{
    record, template, ActionTemplate, Failure, OperationRef, Pattern, SyncRule, SyncSpec, Value,
};
use concept_sync_runtime::metrics::MetricsServer;
use concept_sync_runtime::requesting::{REQUEST, RESPOND};
use concept_sync_runtime::{Requesting, RequestingConfig};
use concept_sync_testing::{EngineHarness, ScriptedConcept, next_invocation};
use concept_sync_web::{AppState, CORRELATION_ID_HEADER, PassthroughPolicy, ServerConfig, router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;

// ============================================================================
// Test Fixtures
// ============================================================================

const CREATE_ITEM: OperationRef = OperationRef::new("Item", "createItem");
const DELETE_ITEM: OperationRef = OperationRef::new("Item", "deleteItem");
const ALL_ITEMS: OperationRef = OperationRef::new("Item", "_getAllItems");

fn items() -> ScriptedConcept {
    ScriptedConcept::new("Item")
        .action(CREATE_ITEM, |input| {
            match input.get("title").and_then(Value::as_str) {
                Some(title) if !title.is_empty() => {
                    Ok(record(json!({ "item": format!("item-{title}") })))
                }
                _ => Err(Failure::new("title is required")),
            }
        })
        .action(DELETE_ITEM, |_| Err(Failure::new("not owner")))
        .table(
            ALL_ITEMS,
            vec![
                record(json!({ "item": "i1", "title": "Drill" })),
                record(json!({ "item": "i2", "title": "Ladder" })),
            ],
        )
}

fn create_item_request() -> SyncRule {
    SyncRule::build("CreateItemRequest", |v| {
        let (request, title) = (v.var("request"), v.var("title"));
        SyncSpec::new()
            .when(Pattern::new(
                REQUEST,
                template! { "path" => "/Item/createItem", "title" => title },
                template! { "request" => request },
            ))
            .then(ActionTemplate::new(CREATE_ITEM, template! { "title" => title }))
    })
}

fn create_item_response() -> SyncRule {
    SyncRule::build("CreateItemResponse", |v| {
        let (request, item) = (v.var("request"), v.var("item"));
        SyncSpec::new()
            .when(Pattern::new(
                REQUEST,
                template! { "path" => "/Item/createItem" },
                template! { "request" => request },
            ))
            .when(Pattern::new(CREATE_ITEM, template! {}, template! { "item" => item }))
            .then(ActionTemplate::new(RESPOND, template! { "request" => request, "item" => item }))
    })
}

fn create_item_error() -> SyncRule {
    SyncRule::build("CreateItemError", |v| {
        let (request, error) = (v.var("request"), v.var("error"));
        SyncSpec::new()
            .when(Pattern::new(
                REQUEST,
                template! { "path" => "/Item/createItem" },
                template! { "request" => request },
            ))
            .when(Pattern::failure(CREATE_ITEM, template! {}, error))
            .then(ActionTemplate::new(RESPOND, template! { "request" => request, "error" => error }))
    })
}

fn policy() -> PassthroughPolicy {
    PassthroughPolicy::new()
        .include("Item/_getAllItems", "public browse")
        .exclude("Item/createItem")
}

fn state(timeout: Duration) -> AppState {
    let config = ServerConfig::default()
        .with_allowed_origin("https://lending.example")
        .with_requesting(RequestingConfig::default().with_timeout(timeout));
    let requesting = Arc::new(Requesting::new(config.requesting.clone()));
    let engine = EngineHarness::new()
        .concept(Arc::clone(&requesting))
        .concept(Arc::new(items()))
        .rule(create_item_request())
        .rule(create_item_response())
        .rule(create_item_error())
        .build();
    AppState::new(engine, requesting, config)
}

fn app(timeout: Duration) -> (AppState, Router) {
    let state = state(timeout);
    let app = router(state.clone(), &policy());
    (state, app)
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, body)
}

// ============================================================================
// Requesting route
// ============================================================================

#[tokio::test]
async fn requesting_route_replies_with_responded_payload() {
    let (state, app) = app(Duration::from_secs(2));
    let (status, body) = send(&app, post("/api/Item/createItem", r#"{"title":"Drill"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "item": "item-Drill" }));
    assert_eq!(state.requesting.pending_count(), 0);
}

#[tokio::test]
async fn concept_failure_is_an_ok_error_reply() {
    let (_, app) = app(Duration::from_secs(2));
    let (status, body) = send(&app, post("/api/Item/createItem", r#"{"title":""}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "error": "title is required" }));
}

#[tokio::test]
async fn non_object_body_is_bad_request() {
    let (_, app) = app(Duration::from_secs(2));
    for body in ["[1, 2]", "42", "not json"] {
        let (status, reply) = send(&app, post("/api/Item/createItem", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply, json!({ "error": "Invalid request body" }));
    }
}

#[tokio::test]
async fn unanswered_request_is_gateway_timeout() {
    let (state, app) = app(Duration::from_millis(50));
    let (status, body) = send(&app, post("/api/Item/unknownAction", "{}")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body, json!({ "error": "Request timed out." }));
    assert_eq!(state.requesting.pending_count(), 0);
}

#[tokio::test]
async fn requesting_operations_are_not_passthrough() {
    let (_, app) = app(Duration::from_millis(50));
    // Falls through to the requesting route, where no rule answers
    let (status, _) = send(
        &app,
        post("/api/Requesting/respond", r#"{"request":"00000000-0000-0000-0000-000000000000"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn shutdown_releases_waiting_requests() {
    let (state, app) = app(Duration::from_secs(30));
    let call = tokio::spawn({
        let app = app.clone();
        async move { send(&app, post("/api/Item/unknownAction", "{}")).await }
    });
    while state.requesting.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    state.shutdown.cancel();

    let (status, body) = call.await.unwrap();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "Internal server error" }));
    assert_eq!(state.requesting.pending_count(), 0);
}

// ============================================================================
// Passthrough routes
// ============================================================================

#[tokio::test]
async fn passthrough_query_returns_rows() {
    let (_, app) = app(Duration::from_secs(2));
    // Unparseable bodies are treated as an empty input
    let (status, body) = send(&app, post("/api/Item/_getAllItems", "not json")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{ "item": "i1", "title": "Drill" }, { "item": "i2", "title": "Ladder" }])
    );
}

#[tokio::test]
async fn passthrough_action_is_recorded() {
    let (state, app) = app(Duration::from_secs(2));
    let mut invocations = state.engine.subscribe_invocations();

    let (status, body) = send(&app, post("/api/Item/deleteItem", r#"{"item":"i1"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "error": "not owner" }));

    let recorded = next_invocation(&mut invocations, DELETE_ITEM, Duration::from_secs(1))
        .await
        .expect("passthrough action should be recorded");
    assert_eq!(recorded.input.get("item"), Some(&json!("i1")));
    assert!(recorded.output.is_err());
}

#[tokio::test]
async fn passthrough_after_shutdown_is_internal_error() {
    let (state, app) = app(Duration::from_secs(2));
    state.engine.shutdown(Duration::from_millis(100)).await.unwrap();
    let (status, body) = send(&app, post("/api/Item/deleteItem", "{}")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "An internal server error occurred." }));
}

// ============================================================================
// Health, CORS, correlation
// ============================================================================

#[tokio::test]
async fn liveness_endpoints() {
    let (_, app) = app(Duration::from_secs(2));
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "port": 10000 }));

    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], json!("Requesting server running"));
}

#[tokio::test]
async fn readiness_reflects_engine_state() {
    let (state, app) = app(Duration::from_secs(2));
    let (status, body) = send(&app, get("/health/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["checks"].as_array().unwrap().len(), 2);

    state.engine.shutdown(Duration::from_millis(100)).await.unwrap();
    let (status, body) = send(&app, get("/health/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], json!("unhealthy"));
}

#[tokio::test]
async fn metrics_route_needs_an_installed_recorder() {
    let (_, app) = app(Duration::from_secs(2));
    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let mut metrics = MetricsServer::new("127.0.0.1:0".parse().unwrap());
    metrics.start().unwrap();
    let state = state(Duration::from_secs(2)).with_metrics(metrics);
    let app = router(state, &policy());

    let (status, _) = send(&app, post("/api/Item/createItem", r#"{"title":"Saw"}"#)).await;
    assert_eq!(status, StatusCode::OK);

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("requesting_opened_total"));
}

#[tokio::test]
async fn preflight_allows_local_and_configured_origins() {
    let (_, app) = app(Duration::from_secs(2));
    for origin in ["http://localhost:5173", "https://lending.example/"] {
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/Item/createItem")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            origin
        );
    }
}

#[tokio::test]
async fn responses_carry_correlation_id() {
    let (_, app) = app(Duration::from_secs(2));
    let response = app.oneshot(get("/health")).await.unwrap();
    assert!(response.headers().contains_key(CORRELATION_ID_HEADER));
}

// ============================================================================
// Serving
// ============================================================================

#[tokio::test]
async fn serves_over_tcp_until_shutdown() {
    let state = state(Duration::from_secs(2));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn({
        let state = state.clone();
        async move { concept_sync_web::server::serve_on(listener, state, &policy()).await }
    });

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert!(reply.starts_with("HTTP/1.1 200"));
    assert!(reply.contains(r#""status":"ok""#));

    state.shutdown.cancel();
    server.await.unwrap().unwrap();
}
