//! Shared test helpers for throttle integration tests
//!
//! Provides fast limiters for wiremock-backed session tests, mock mounting
//! helpers for throttled endpoints, and a recorder for queue dispatch order.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use claudectx_throttle::{RateLimitConfig, RateLimitedSession, RateLimiter};

/// Limiter that never gets in the way, with millisecond backoff.
pub fn fast_limiter(max_retries: u32) -> Arc<RateLimiter> {
    let config = RateLimitConfig::new(1000.0, 100, max_retries)
        .expect("valid config")
        .with_backoff(Duration::from_millis(10), Duration::from_millis(100));
    Arc::new(RateLimiter::new(config))
}

/// Starts a mock server and returns a session against a fast limiter.
pub async fn setup_session(max_retries: u32) -> (MockServer, RateLimitedSession) {
    let server = MockServer::start().await;
    let session = RateLimitedSession::new(reqwest::Client::new(), fast_limiter(max_retries))
        .with_key("conversations");
    (server, session)
}

/// Mounts `count` 429 responses for `GET route`, optionally with Retry-After,
/// followed by a 200 with a small JSON body.
pub async fn mount_throttled_then_ok(
    server: &MockServer,
    route: &str,
    count: u64,
    retry_after: Option<&str>,
) {
    let mut throttled = ResponseTemplate::new(429);
    if let Some(value) = retry_after {
        throttled = throttled.insert_header("Retry-After", value);
    }

    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(throttled)
        .up_to_n_times(count)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uuid": "conv-001",
            "name": "Rust questions"
        })))
        .mount(server)
        .await;
}

/// Records the order in which queued work starts running.
#[derive(Clone, Default)]
pub struct DispatchLog {
    order: Arc<Mutex<Vec<String>>>,
}

impl DispatchLog {
    pub fn record(&self, label: impl Into<String>) {
        self.order.lock().unwrap().push(label.into());
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

/// Tracks concurrently running work and the peak concurrency seen.
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Lets spawned tasks (dispatch loop, work) run under a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
