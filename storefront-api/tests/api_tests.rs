/// HTTP tests for the API router
///
/// The router is driven in-process with `tower::ServiceExt::oneshot` against
/// the in-memory database backend.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use serde_json::Value;
use std::sync::Arc;
use storefront_api::app::{build_router, AppState};
use storefront_shared::db::backend::mock::MockFactory;
use storefront_shared::db::config::PoolConfig;
use storefront_shared::db::Database;
use tower::ServiceExt;

fn test_state(factory: &MockFactory) -> AppState {
    let config = PoolConfig::new("localhost", 5432, "shop", "secret", "shop");
    AppState::new(Database::new(config, Arc::new(factory.clone())))
}

async fn send(state: AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(state).oneshot(request).await.unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn get_health(state: AppState) -> (StatusCode, Value) {
    send(state, Request::get("/health").body(Body::empty()).unwrap()).await
}

fn add_item_request(user_id: &str, body: &str) -> Request<Body> {
    Request::post(format!("/v1/users/{}/cart", user_id))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

const USER_ID: &str = "6f1c0a8e-3b7d-4c2a-9e51-0d4b8f2a7c13";
const PRODUCT_ID: &str = "b2d4e6f8-1a3c-4e5f-8a9b-c0d1e2f3a4b5";

#[tokio::test]
async fn test_health_reports_pool_stats() {
    let factory = MockFactory::new();
    let state = test_state(&factory);
    state.db.init().await.unwrap();

    let (status, body) = get_health(state.clone()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "connected");
    assert_eq!(body["pool"]["max_connections"], 10);
    assert_eq!(body["pool"]["leased"], 0);

    state.db.shutdown().await;
}

#[tokio::test]
async fn test_health_before_init_is_unavailable() {
    let factory = MockFactory::new();
    let (status, body) = get_health(test_state(&factory)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["database"], "unavailable");
    assert!(body.get("pool").is_none());
    assert_eq!(factory.connects(), 0);
}

#[tokio::test]
async fn test_health_after_shutdown_is_unavailable() {
    let factory = MockFactory::new();
    let state = test_state(&factory);
    state.db.init().await.unwrap();
    state.db.shutdown().await;

    let (status, body) = get_health(state).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["database"], "unavailable");
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let factory = MockFactory::new();
    let response = build_router(test_state(&factory))
        .oneshot(Request::get("/v1/nothing").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_products_before_init_is_unavailable() {
    let factory = MockFactory::new();
    let (status, body) = send(
        test_state(&factory),
        Request::get("/v1/products").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "service_unavailable");
}

#[tokio::test]
async fn test_products_page_size_is_validated() {
    let factory = MockFactory::new();
    let state = test_state(&factory);
    state.db.init().await.unwrap();

    let (status, body) = send(
        state,
        Request::get("/v1/products?limit=500").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    // Rejected before any statement ran (only the startup probe)
    assert_eq!(factory.statements(), 1);
}

#[tokio::test]
async fn test_add_item_rejects_non_positive_quantity() {
    let factory = MockFactory::new();
    let state = test_state(&factory);
    state.db.init().await.unwrap();

    let body = format!(r#"{{"product_id": "{}", "quantity": 0}}"#, PRODUCT_ID);
    let (status, body) = send(state.clone(), add_item_request(USER_ID, &body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    assert_eq!(factory.statements(), 1);
    assert_eq!(state.db.stats().unwrap().leased, 0);
}

#[tokio::test]
async fn test_database_failure_is_internal_error_without_details() {
    let factory = MockFactory::new();
    let state = test_state(&factory);
    state.db.init().await.unwrap();

    // The in-memory backend rejects row locks, so the transaction rolls back
    let body = format!(r#"{{"product_id": "{}", "quantity": 1}}"#, PRODUCT_ID);
    let (status, body) = send(state.clone(), add_item_request(USER_ID, &body)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "internal_error");
    assert_eq!(body["message"], "An internal error occurred");

    let stats = state.db.stats().unwrap();
    assert_eq!(stats.leased, 0);
}

#[tokio::test]
async fn test_malformed_id_is_rejected() {
    let factory = MockFactory::new();
    let state = test_state(&factory);
    state.db.init().await.unwrap();

    let response = build_router(state)
        .oneshot(Request::get("/v1/products/not-a-uuid").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(factory.statements(), 1);
}
