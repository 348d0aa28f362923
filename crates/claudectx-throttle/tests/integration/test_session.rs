//! Integration tests for RateLimitedSession retry behaviour
//!
//! Uses wiremock to return 429s, Retry-After headers and plain errors.

use std::time::{Duration, Instant};

use claudectx_throttle::ThrottleError;
use reqwest::{Method, StatusCode};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_retries_429_then_succeeds() {
    let (server, session) = common::setup_session(3).await;
    common::mount_throttled_then_ok(&server, "/api/conversations", 2, None).await;

    let response = session
        .get(&format!("{}/api/conversations", server.uri()))
        .await
        .expect("request should succeed after retries");

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["uuid"], "conv-001");

    let metrics = session.limiter().get_metrics(Some("conversations"));
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.throttled_responses, 2);
}

#[tokio::test]
async fn test_retries_exhausted_after_max_retries() {
    let (server, session) = common::setup_session(2).await;

    Mock::given(method("GET"))
        .and(path("/api/export"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let url = format!("{}/api/export", server.uri());
    let err = session.get(&url).await.unwrap_err();

    match err {
        ThrottleError::RetriesExhausted {
            url: failed_url,
            attempts,
            retry_after,
            ..
        } => {
            assert_eq!(failed_url, url);
            assert_eq!(attempts, 3);
            assert!(retry_after.is_none());
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retry_after_sets_minimum_delay() {
    let (server, session) = common::setup_session(3).await;
    common::mount_throttled_then_ok(&server, "/api/projects", 1, Some("1")).await;

    let start = Instant::now();
    let response = session
        .get(&format!("{}/api/projects", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // Backoff base is 10ms, so only Retry-After explains a full second
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_other_statuses_are_not_retried() {
    let (server, session) = common::setup_session(3).await;

    Mock::given(method("GET"))
        .and(path("/api/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let response = session
        .get(&format!("{}/api/broken", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(session.limiter().get_metrics(None).throttled_responses, 0);
}

#[tokio::test]
async fn test_post_json_sends_body_and_user_agent() {
    let (server, session) = common::setup_session(1).await;
    let session = session.with_user_agent("claudectx-test/1.0");

    Mock::given(method("POST"))
        .and(path("/api/search"))
        .and(header("user-agent", "claudectx-test/1.0"))
        .and(body_json(serde_json::json!({ "query": "tokio" })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let response = session
        .post_json(
            &format!("{}/api/search", server.uri()),
            &serde_json::json!({ "query": "tokio" }),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_execute_with_custom_method() {
    let (server, session) = common::setup_session(1).await;

    Mock::given(method("DELETE"))
        .and(path("/api/conversations/conv-001"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let response = session
        .execute(
            Method::DELETE,
            &format!("{}/api/conversations/conv-001", server.uri()),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_connection_failures_are_retried_then_surfaced() {
    let (_server, session) = common::setup_session(1).await;

    // Nothing listens on port 1
    let err = session.get("http://127.0.0.1:1/api").await.unwrap_err();

    match err {
        ThrottleError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(session.limiter().get_metrics(None).total_requests, 2);
}
