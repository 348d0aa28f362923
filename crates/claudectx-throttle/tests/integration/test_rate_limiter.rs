//! Integration tests for the keyed RateLimiter shared across tasks

use std::{sync::Arc, time::Duration};

use claudectx_throttle::{RateLimitConfig, RateLimiter, DEFAULT_KEY};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_bulk_export_pacing() {
    // 3 requests/sec with a burst of 5: the settings bulk exports run with
    let limiter = RateLimiter::new(RateLimitConfig::new(3.0, 5, 3).unwrap());
    let start = Instant::now();

    for _ in 0..10 {
        limiter.acquire("conversations").await;
    }

    // 5 immediate, then 5 more at 3/sec
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs_f64(5.0 / 3.0 - 0.005), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

    let metrics = limiter.get_metrics(Some("conversations"));
    assert_eq!(metrics.total_requests, 10);
    assert_eq!(metrics.requests_per_minute, 10);
}

#[tokio::test(start_paused = true)]
async fn test_keys_do_not_share_tokens() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(1.0, 2, 0).unwrap()));
    let start = Instant::now();

    let mut tasks = Vec::new();
    for key in ["conversations", "projects", "messages"] {
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move {
            limiter.acquire(key).await;
            limiter.acquire(key).await;
            start.elapsed()
        }));
    }

    for task in tasks {
        // Each key spends only its own burst
        assert!(task.await.unwrap() < Duration::from_millis(1));
    }

    assert_eq!(limiter.keys().len(), 3);
    assert_eq!(limiter.get_metrics(None).total_requests, 6);
    assert_eq!(limiter.get_metrics(Some(DEFAULT_KEY)).total_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_on_one_key_are_spaced() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(4.0, 1, 0).unwrap()));
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move {
            limiter.acquire(DEFAULT_KEY).await;
            start.elapsed()
        }));
    }

    let mut grants = Vec::new();
    for task in tasks {
        grants.push(task.await.unwrap());
    }
    grants.sort();

    // One burst token, then 4 more at 4/sec
    assert!(grants[0] < Duration::from_millis(1));
    assert!(grants[4] >= Duration::from_millis(995), "{:?}", grants[4]);

    let tokens = limiter.available_tokens(DEFAULT_KEY).unwrap();
    assert!((0.0..=1.0).contains(&tokens));
}

#[tokio::test(start_paused = true)]
async fn test_idle_bucket_refills_to_burst_only() {
    let limiter = RateLimiter::new(RateLimitConfig::new(10.0, 3, 0).unwrap());
    for _ in 0..3 {
        assert!(limiter.try_acquire("search"));
    }
    assert!(!limiter.try_acquire("search"));

    tokio::time::advance(Duration::from_secs(30)).await;

    // Refill stops at the burst size no matter how long the key idles
    for _ in 0..3 {
        assert!(limiter.try_acquire("search"));
    }
    assert!(!limiter.try_acquire("search"));
}
