mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::TestEngine;
use serde_json::{json, Value};
use stockkeeper::handlers;
use tower::ServiceExt;

async fn app() -> Router {
    let t = TestEngine::new().await;
    t.seed("X-1", &[("A", 10), ("B", 3)]).await;
    handlers::router(t.engine.clone())
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-actor-id", "picker-1")
        .header("x-actor-name", "Ana Picker");
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_is_public() {
    let app = app().await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn mutations_require_an_actor() {
    let app = app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/reservations/order-1/consume")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn reserve_then_consume_over_http() {
    let app = app().await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/reservations/order-1",
        Some(json!({"lines": [{"sku": "X-1", "quantity": 12}]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = call(&app, "POST", "/api/v1/reservations/order-1/consume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["units"], 12);

    let (_, body) = call(&app, "GET", "/api/v1/stock/X-1/B", None).await;
    assert_eq!(body["data"]["available"], 1);
    assert_eq!(body["data"]["committed"], 0);
}

#[tokio::test]
async fn failures_map_to_status_codes() {
    let app = app().await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/reservations/order-2",
        Some(json!({"lines": [{"sku": "X-1", "quantity": 50}]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error_code"], "insufficient_stock");
    assert_eq!(body["details"]["shortfalls"][0]["available"], 13);

    let (status, body) = call(
        &app,
        "GET",
        "/api/v1/sessions/00000000-0000-0000-0000-000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "not_found");
}

#[tokio::test]
async fn session_version_conflicts_are_409() {
    let app = app().await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/sessions",
        Some(json!({"lines": [{"sku": "X-1", "quantity": 2}], "notes": {"picker_name": "Ana"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let touch = format!("/api/v1/sessions/{}/touch", id);
    let (status, body) = call(&app, "POST", &touch, Some(json!({"expected_version": 1}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 2);

    // a stale touch is retried once against the current version
    let (status, body) = call(&app, "POST", &touch, Some(json!({"expected_version": 1}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 3);

    // recovery never retries, so the conflict surfaces
    let recover = format!("/api/v1/zombies/{}/recover", id);
    let (status, body) = call(&app, "POST", &recover, Some(json!({"expected_version": 1}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "version_conflict");
    assert_eq!(body["details"]["current_version"], 3);
}
