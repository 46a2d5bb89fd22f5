//! End-to-end admission behavior through the middleware stack.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower::ServiceExt;

use turnstile::{AdmissionLayer, LimiterConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn app_from_yaml(yaml: &str) -> Router {
    let limiter = LimiterConfig::from_yaml(yaml).unwrap().build().await.unwrap();
    Router::new()
        .route("/", get(|| async { "ok" }))
        .layer(AdmissionLayer::new(limiter))
}

fn request() -> Request {
    Request::builder().uri("/").body(Body::empty()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_window_admits_exactly_the_limit_under_concurrency() {
    init_tracing();
    let app = app_from_yaml(
        r#"
strategy: fixed_window
limit: 10
window: 10s
key: request_uri
"#,
    )
    .await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..20 {
        let app = app.clone();
        tasks.spawn(async move { app.oneshot(request()).await.unwrap().status() });
    }

    let mut admitted = 0;
    let mut throttled = 0;
    while let Some(status) = tasks.join_next().await {
        match status.unwrap() {
            StatusCode::OK => admitted += 1,
            StatusCode::TOO_MANY_REQUESTS => throttled += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(throttled, 10);
}

#[tokio::test]
async fn fixed_window_rolls_over_after_the_window() {
    init_tracing();
    let app = app_from_yaml(
        r#"
strategy: fixed_window
limit: 3
window: 200ms
key: request_uri
"#,
    )
    .await;

    for _ in 0..3 {
        let status = app.clone().oneshot(request()).await.unwrap().status();
        assert_eq!(status, StatusCode::OK);
    }
    let status = app.clone().oneshot(request()).await.unwrap().status();
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let status = app.clone().oneshot(request()).await.unwrap().status();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn token_bucket_burst_then_single_refill() {
    init_tracing();
    let app = app_from_yaml(
        r#"
strategy: token_bucket
capacity: 5
refill_rate: 1.0
"#,
    )
    .await;

    for _ in 0..5 {
        let status = app.clone().oneshot(request()).await.unwrap().status();
        assert_eq!(status, StatusCode::OK);
    }
    let status = app.clone().oneshot(request()).await.unwrap().status();
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    tokio::time::sleep(Duration::from_millis(1050)).await;
    let status = app.clone().oneshot(request()).await.unwrap().status();
    assert_eq!(status, StatusCode::OK);
    let status = app.clone().oneshot(request()).await.unwrap().status();
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn adaptive_limiter_admits_sequential_traffic() {
    init_tracing();
    let app = app_from_yaml(
        r#"
strategy: adaptive
initial_concurrency: 2
"#,
    )
    .await;

    // Sequential requests never hold more than one slot.
    for _ in 0..20 {
        let status = app.clone().oneshot(request()).await.unwrap().status();
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn noop_strategy_admits_everything() {
    init_tracing();
    let app = app_from_yaml("strategy: no_op").await;

    for _ in 0..50 {
        let status = app.clone().oneshot(request()).await.unwrap().status();
        assert_eq!(status, StatusCode::OK);
    }
}
