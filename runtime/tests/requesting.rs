//! Integration tests for the request bridge driven by sync rules
//!
//! Each test opens requests through `Requesting::handle`, lets rules react to
//! the `Requesting.request` invocation, and checks what the waiter receives.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use concept_sync_core::{
    record, template, ActionTemplate, Failure, OperationRef, Pattern, Record, SyncRule, SyncSpec,
    Value,
};
use concept_sync_runtime::requesting::{GET_RESPONSE, REQUEST, RESPOND};
use concept_sync_runtime::{Engine, EngineError, Requesting, RequestingConfig, RequestingError};
use concept_sync_testing::{EngineHarness, FailingResponseStore, ScriptedConcept, next_invocation};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Fixtures
// ============================================================================

const CREATE_ITEM: OperationRef = OperationRef::new("Item", "createItem");

fn items() -> ScriptedConcept {
    ScriptedConcept::new("Item").action(CREATE_ITEM, |input| {
        match input.get("title").and_then(Value::as_str) {
            Some(title) if !title.is_empty() => Ok(record(json!({ "item": format!("item-{title}") }))),
            _ => Err(Failure::new("title is required")),
        }
    })
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

fn setup(config: RequestingConfig) -> (Arc<Requesting>, Engine) {
    let requesting = Arc::new(Requesting::new(config));
    let engine = EngineHarness::new()
        .concept(Arc::clone(&requesting))
        .concept(Arc::new(items()))
        .rule(create_item_request())
        .rule(create_item_response())
        .rule(create_item_error())
        .build();
    (requesting, engine)
}

fn payload(path: &str, title: &str) -> Record {
    record(json!({ "path": path, "title": title }))
}

// ============================================================================
// Round trips
// ============================================================================

#[tokio::test]
async fn rules_answer_the_request() {
    let (requesting, engine) = setup(RequestingConfig::default());
    let reply = requesting
        .handle(
            &engine,
            payload("/Item/createItem", "Drill"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(Value::Object(reply), json!({ "item": "item-Drill" }));
    assert_eq!(requesting.pending_count(), 0);
}

#[tokio::test]
async fn failures_become_error_replies() {
    let (requesting, engine) = setup(RequestingConfig::default());
    let reply = requesting
        .handle(
            &engine,
            payload("/Item/createItem", ""),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(Value::Object(reply), json!({ "error": "title is required" }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_get_their_own_replies() {
    let (requesting, engine) = setup(RequestingConfig::default());
    let calls = (0..32).map(|n| {
        let (requesting, engine) = (Arc::clone(&requesting), engine.clone());
        tokio::spawn(async move {
            let title = format!("t{n}");
            let reply = requesting
                .handle(
                    &engine,
                    payload("/Item/createItem", &title),
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            (title, reply)
        })
    });
    for call in futures::future::join_all(calls).await {
        let (title, reply) = call.unwrap();
        assert_eq!(reply.get("item"), Some(&json!(format!("item-{title}"))));
    }
    assert_eq!(requesting.pending_count(), 0);
}

#[tokio::test]
async fn responses_are_mirrored_for_audit() {
    let (requesting, engine) = setup(RequestingConfig::default());
    let mut invocations = engine.subscribe_invocations();
    requesting
        .handle(
            &engine,
            payload("/Item/createItem", "Ladder"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let responded = next_invocation(&mut invocations, RESPOND, Duration::from_secs(1))
        .await
        .expect("respond should be recorded");
    let request = responded.output.as_ref().unwrap()["request"].clone();
    let rows = engine
        .query(GET_RESPONSE, record(json!({ "request": request })))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["response"], json!({ "item": "item-Ladder" }));
    assert_eq!(rows[0]["input"]["path"], json!("/Item/createItem"));
}

#[tokio::test]
async fn responses_are_not_mirrored_when_disabled() {
    let (requesting, engine) = setup(RequestingConfig::default().with_save_responses(false));
    let mut invocations = engine.subscribe_invocations();
    requesting
        .handle(
            &engine,
            payload("/Item/createItem", "Saw"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let responded = next_invocation(&mut invocations, RESPOND, Duration::from_secs(1))
        .await
        .expect("respond should be recorded");
    let request = responded.output.as_ref().unwrap()["request"].clone();
    let rows = engine
        .query(GET_RESPONSE, record(json!({ "request": request })))
        .await
        .unwrap();
    assert!(rows[0].get("response").is_none());
}

#[tokio::test]
async fn reply_survives_a_failing_audit_mirror() {
    let requesting = Arc::new(Requesting::with_store(
        RequestingConfig::default(),
        Arc::new(FailingResponseStore::on_responses()),
    ));
    let engine = EngineHarness::new()
        .concept(Arc::clone(&requesting))
        .concept(Arc::new(items()))
        .rule(create_item_request())
        .rule(create_item_response())
        .rule(create_item_error())
        .build();
    let mut invocations = engine.subscribe_invocations();

    let reply = requesting
        .handle(
            &engine,
            payload("/Item/createItem", "Drill"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(Value::Object(reply), json!({ "item": "item-Drill" }));
    assert_eq!(requesting.pending_count(), 0);

    // The mirror failure is still visible as a failed respond
    let responded = next_invocation(&mut invocations, RESPOND, Duration::from_secs(1))
        .await
        .expect("respond should be recorded");
    assert!(!responded.succeeded());
}

#[tokio::test]
async fn direct_respond_reaches_waiter_when_mirror_fails() {
    let requesting = Arc::new(Requesting::with_store(
        RequestingConfig::default(),
        Arc::new(FailingResponseStore::on_responses()),
    ));
    let engine = EngineHarness::new().concept(Arc::clone(&requesting)).build();
    let request = requesting.open(Record::new()).await.unwrap();

    let output = engine
        .invoke(RESPOND, record(json!({ "request": request, "value": 42 })))
        .await
        .unwrap();
    assert!(output.is_err());

    let reply = requesting
        .await_response(request, Duration::from_millis(50), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(Value::Object(reply), json!({ "value": 42 }));
}

// ============================================================================
// Failure outcomes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let (requesting, engine) = setup(RequestingConfig::default());
    let err = requesting
        .handle(
            &engine,
            payload("/Item/unknown", "x"),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(requesting.pending_count(), 0);
}

#[tokio::test]
async fn store_failure_rejects_request() {
    let requesting = Arc::new(Requesting::with_store(
        RequestingConfig::default(),
        Arc::new(FailingResponseStore::new()),
    ));
    let engine = EngineHarness::new().concept(Arc::clone(&requesting)).build();
    let err = requesting
        .handle(
            &engine,
            payload("/Item/createItem", "x"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RequestingError::Rejected(_)));
    assert_eq!(requesting.pending_count(), 0);
}

#[tokio::test]
async fn shut_down_engine_refuses_requests() {
    let (requesting, engine) = setup(RequestingConfig::default());
    engine.shutdown(Duration::from_millis(100)).await.unwrap();
    let err = requesting
        .handle(
            &engine,
            payload("/Item/createItem", "x"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, RequestingError::Engine(EngineError::ShutdownInProgress));
}
