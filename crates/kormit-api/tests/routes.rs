//! ---
//! kormit_section: "05-networking-external-interfaces"
//! kormit_subsection: "tests"
//! kormit_type: "test"
//! kormit_scope: "code"
//! kormit_description: "Route-level tests for the REST API."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use kormit_api::{router, ApiState};
use kormit_common::SequentialIdGenerator;
use kormit_core::{Reconciler, ReconcilerSettings};
use kormit_registry::ContainerRegistry;
use kormit_runtime::{RetryPolicy, SimulatedRuntime};
use serde_json::{json, Value};
use tower::ServiceExt;

const ORIGIN: &str = "http://localhost:8081";

fn app() -> (Arc<SimulatedRuntime>, Router) {
    let engine = Arc::new(SimulatedRuntime::new());
    let retry = RetryPolicy::new(
        2,
        Duration::from_millis(1),
        Duration::from_millis(2),
        Duration::ZERO,
    );
    let registry = Arc::new(ContainerRegistry::new(engine.clone(), retry.clone()));
    let settings = ReconcilerSettings {
        stop_grace_period: Duration::from_secs(1),
        ready_timeout: Duration::from_millis(200),
        ready_poll_interval: Duration::from_millis(10),
    };
    let reconciler = Reconciler::new(engine.clone(), registry, settings)
        .with_ids(Arc::new(SequentialIdGenerator::new("d")))
        .with_retry(retry);
    let state = Arc::new(ApiState::new(Arc::new(reconciler)));
    let router = router(state, &[ORIGIN.to_owned()]).expect("router");
    (engine, router)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn root_reports_health() {
    let (_, app) = app();
    let (status, body) = send(&app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "message": "Kormit API running"}));
}

#[tokio::test]
async fn deployment_lifecycle_over_http() {
    let (engine, app) = app();
    let (status, created) = send(
        &app,
        Method::POST,
        "/api/deployments",
        Some(json!({"name": "web", "description": "front", "replicas": 2, "image": "nginx"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], "d-1");
    assert_eq!(created["status"], "running");
    assert_eq!(created["replicas"], 2);
    assert!(created["createdAt"].is_string());
    assert_eq!(engine.running_count(), 2);

    let (status, list) = send(&app, Method::GET, "/api/deployments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().map(Vec::len), Some(1));

    let (status, scaled) = send(
        &app,
        Method::POST,
        "/api/deployments/d-1/scale",
        Some(json!({"replicas": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scaled["replicas"], 1);
    assert_eq!(engine.running_count(), 1);

    let (status, stopped) = send(&app, Method::POST, "/api/deployments/d-1/deactivate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "stopped");

    let (status, running) = send(&app, Method::POST, "/api/deployments/d-1/activate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(running["status"], "running");

    let (status, restarted) = send(&app, Method::POST, "/api/deployments/d-1/restart", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restarted["status"], "running");

    let (status, _) = send(&app, Method::DELETE, "/api/deployments/d-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(engine.container_count(), 0);

    let (status, body) = send(&app, Method::GET, "/api/deployments/d-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().is_some_and(|m| m.contains("d-1")));
}

#[tokio::test]
async fn negative_scale_is_a_bad_request() {
    let (engine, app) = app();
    send(
        &app,
        Method::POST,
        "/api/deployments",
        Some(json!({"name": "web", "replicas": 1, "image": "nginx"})),
    )
    .await;
    let mutations = engine.mutation_calls();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/deployments/d-1/scale",
        Some(json!({"replicas": -1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());
    assert_eq!(engine.mutation_calls(), mutations);
}

#[tokio::test]
async fn deleting_unknown_deployment_succeeds() {
    let (_, app) = app();
    let (status, _) = send(&app, Method::DELETE, "/api/deployments/nope", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unreachable_engine_maps_to_service_unavailable() {
    let (engine, app) = app();
    engine.set_unavailable_for(100);
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/deployments",
        Some(json!({"name": "web", "replicas": 1, "image": "nginx"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn container_routes_and_logs() {
    let (engine, app) = app();
    let (status, created) = send(
        &app,
        Method::POST,
        "/api/containers",
        Some(json!({"name": "tools", "image": "busybox"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().expect("id").to_owned();
    assert_eq!(created["status"], "created");

    for line in ["one", "two", "three"] {
        assert!(engine.push_log(&id, line));
    }
    let (status, logs) = send(
        &app,
        Method::GET,
        &format!("/api/containers/{id}/logs?tail=2"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs, json!({"id": id, "logs": ["two", "three"]}));

    let (status, started) = send(&app, Method::POST, &format!("/api/containers/{id}/start"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["status"], "running");

    let (status, stopped) = send(&app, Method::POST, &format!("/api/containers/{id}/stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "stopped");

    let (status, list) = send(&app, Method::GET, "/api/containers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().map(Vec::len), Some(1));

    let (status, _) = send(&app, Method::DELETE, &format!("/api/containers/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::GET, &format!("/api/containers/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_container_is_not_found() {
    let (_, app) = app();
    let (status, _) = send(&app, Method::POST, "/api/containers/ghost/start", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::GET, "/api/containers/ghost/logs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_preflight_allows_configured_origin() {
    let (_, app) = app();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/deployments")
        .header(header::ORIGIN, ORIGIN)
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert!(response.status().is_success());
    let headers = response.headers();
    assert_eq!(
        headers
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some(ORIGIN)
    );
    assert_eq!(
        headers
            .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );
}

#[test]
fn invalid_origin_is_rejected() {
    let engine = Arc::new(SimulatedRuntime::new());
    let registry = Arc::new(ContainerRegistry::new(engine.clone(), RetryPolicy::none()));
    let reconciler = Reconciler::new(
        engine,
        registry,
        ReconcilerSettings {
            stop_grace_period: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(1),
            ready_poll_interval: Duration::from_millis(10),
        },
    );
    let state = Arc::new(ApiState::new(Arc::new(reconciler)));
    assert!(router(state, &["bad\norigin".to_owned()]).is_err());
}
