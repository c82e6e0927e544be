//! REST client integration tests.
//!
//! Tests request routing through limiter and retry against a mock venue:
//! - Retry routing by HTTP status
//! - Idempotency keys on order submission
//! - Per-attempt timeouts

mod integration;
use integration::common::mock_rest::{MockRestServer, Reply};

use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;
use xarb_core::ErrorKind;
use xarb_telemetry::metrics::{REST_REQUESTS_TOTAL, REST_RETRIES_TOTAL};
use xarb_rest::{
    BucketConfig, Idempotency, RateLimiterConfig, RestClient, RestConfig, RestError, RetryConfig,
};

fn client(server: &MockRestServer) -> RestClient {
    RestClient::new(RestConfig {
        base_url: server.base_url(),
        timeout: Duration::from_secs(2),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
        },
        limiter: RateLimiterConfig {
            max_in_flight: 4,
            endpoints: vec![BucketConfig::new("/api/*", 50, 100.0)],
            default_bucket: BucketConfig::new("*", 10, 10.0),
        },
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_get_sends_query_params() {
    let server = MockRestServer::start(vec![Reply::status(200)]).await;
    let client = client(&server);

    let response = client
        .request(Method::GET, "/api/v3/depth", json!({"symbol": "BTCUSDT", "limit": 5}))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({"ok": true}));
    assert_eq!(response.attempts, 1);

    let requests = server.requests();
    assert_eq!(requests[0].path, "/api/v3/depth");
    let query = requests[0].query.clone().unwrap();
    assert!(query.contains("symbol=BTCUSDT"));
    assert!(query.contains("limit=5"));
}

#[tokio::test]
async fn test_server_error_retried_then_succeeds() {
    let server = MockRestServer::start(vec![Reply::status(500), Reply::status(200)]).await;
    let client = client(&server);

    let response = client
        .request(Method::GET, "/api/v3/time", Value::Null)
        .await
        .unwrap();

    assert_eq!(response.attempts, 2);
    assert_eq!(server.call_count(), 2);
}

#[tokio::test]
async fn test_request_counted_once_across_retries() {
    let server = MockRestServer::start(vec![Reply::status(500), Reply::status(200)]).await;
    let client = RestClient::new(RestConfig {
        base_url: server.base_url(),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
        },
        limiter: RateLimiterConfig {
            endpoints: vec![BucketConfig::new("/metered", 10, 10.0)],
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();

    let response = client
        .request(Method::GET, "/metered", Value::Null)
        .await
        .unwrap();
    assert_eq!(response.attempts, 2);

    let requests = REST_REQUESTS_TOTAL.with_label_values(&["/metered", "ok"]).get();
    let retries = REST_RETRIES_TOTAL.with_label_values(&["/metered", "server"]).get();
    assert_eq!(requests, 1.0);
    assert_eq!(retries, 1.0);
}

#[tokio::test]
async fn test_rate_limit_exhausts_budget() {
    let server = MockRestServer::start(vec![Reply::status(429)]).await;
    let client = client(&server);

    let err = client
        .request(Method::GET, "/api/v3/ticker", Value::Null)
        .await
        .unwrap_err();

    assert_eq!(server.call_count(), 3);
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    match err {
        RestError::RetriesExhausted {
            attempts, history, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(history.len(), 3);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_retry_after_header_honoured() {
    let server =
        MockRestServer::start(vec![Reply::status(429).with_retry_after(1), Reply::status(200)])
            .await;
    let client = client(&server);

    let started = std::time::Instant::now();
    let response = client
        .request(Method::GET, "/api/v3/ticker", Value::Null)
        .await
        .unwrap();

    assert_eq!(response.attempts, 2);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_auth_failure_single_attempt() {
    let server = MockRestServer::start(vec![Reply::status(401)]).await;
    let client = client(&server);

    let err = client
        .request(Method::GET, "/api/v3/account", Value::Null)
        .await
        .unwrap_err();

    assert_eq!(server.call_count(), 1);
    assert!(matches!(err, RestError::Authentication { status: 401 }));
}

#[tokio::test]
async fn test_validation_error_keeps_body() {
    let server = MockRestServer::start(vec![Reply::status(400)]).await;
    let client = client(&server);

    let err = client
        .request(Method::GET, "/api/v3/depth", json!({"symbol": "NOPE"}))
        .await
        .unwrap_err();

    assert_eq!(server.call_count(), 1);
    match err {
        RestError::Validation { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("scripted"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_post_order_retries_with_same_key() {
    let server = MockRestServer::start(vec![Reply::status(503), Reply::status(200)]).await;
    let client = client(&server);
    let key = RestClient::new_idempotency_key();

    let response = client
        .post_order(
            "/api/v3/order",
            json!({"symbol": "BTCUSDT", "side": "BUY", "quantity": "0.01"}),
            key.clone(),
        )
        .await
        .unwrap();

    assert_eq!(response.attempts, 2);
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.idempotency_key.as_deref(), Some(key.as_str()));
        let body: Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["client_order_id"], json!(key));
        assert_eq!(body["symbol"], "BTCUSDT");
    }
}

#[tokio::test]
async fn test_post_order_keeps_caller_client_order_id() {
    let server = MockRestServer::start(vec![Reply::status(200)]).await;
    let client = client(&server);

    client
        .post_order("/api/v3/order", json!({"client_order_id": "mine"}), "key-1")
        .await
        .unwrap();

    let request = &server.requests()[0];
    let body: Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["client_order_id"], "mine");
    assert_eq!(request.idempotency_key.as_deref(), Some("key-1"));
}

#[tokio::test]
async fn test_mutating_without_key_not_retried() {
    let server = MockRestServer::start(vec![Reply::status(503), Reply::status(200)]).await;
    let client = client(&server);

    let err = client
        .request(Method::POST, "/api/v3/order", json!({"symbol": "BTCUSDT"}))
        .await
        .unwrap_err();

    assert_eq!(server.call_count(), 1);
    assert!(matches!(err, RestError::Server { status: 503, .. }));
    assert!(server.requests()[0].idempotency_key.is_none());
}

#[tokio::test]
async fn test_per_attempt_timeout() {
    let server =
        MockRestServer::start(vec![Reply::status(200).with_delay(Duration::from_millis(500))])
            .await;
    let client = RestClient::new(RestConfig {
        base_url: server.base_url(),
        timeout: Duration::from_millis(50),
        retry: RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        },
        ..Default::default()
    })
    .unwrap();

    let err = client
        .request_with(Method::GET, "/slow", Value::Null, Idempotency::Safe)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(matches!(err, RestError::RetriesExhausted { attempts: 2, .. }));
    // Both attempts reached the venue; each timed out on its own clock.
    assert_eq!(server.call_count(), 2);
    assert_eq!(client.limiter().available_slots(), client.limiter().max_in_flight());
}
