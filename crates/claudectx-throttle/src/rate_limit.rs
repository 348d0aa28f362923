//! Token bucket rate limiting for outbound requests
//!
//! Keeps request volume against the remote API within configured limits,
//! one independent bucket per resource key.
//!
//! ## Architecture
//!
//! - [`TokenBucket`]: Classic token bucket with lazy, continuous refill
//! - [`RateLimiter`]: Owns one bucket per key, created on first use, and
//!   reports per-key or aggregated [`RateLimitMetrics`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use claudectx_throttle::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! # async fn example() -> Result<(), claudectx_throttle::ThrottleError> {
//! let limiter = RateLimiter::new(RateLimitConfig::new(3.0, 5, 3)?);
//! limiter.acquire("conversations").await;
//! // ... make API call ...
//! let metrics = limiter.get_metrics(Some("conversations"));
//! assert_eq!(metrics.total_requests, 1);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use claudectx_core::config::RateLimitingConfig;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ThrottleError;

/// Key used when callers do not name a resource
pub const DEFAULT_KEY: &str = "default";

/// Trailing window for the requests-per-minute metric
const METRICS_WINDOW: Duration = Duration::from_secs(60);

/// Shortest sleep between acquire attempts; absorbs float rounding in refill
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Longest single sleep; only reached by buckets that never refill
const MAX_WAIT: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// TokenBucket
// ============================================================================

/// Internal mutable state for the token bucket, protected by a Mutex.
#[derive(Debug)]
struct TokenBucketInner {
    /// Current number of available tokens (fractional for smooth refill)
    tokens: f64,
    /// Timestamp of the last refill calculation
    last_refill: Instant,
    /// Tokens granted since the bucket was created
    total_requests: u64,
    /// Grant timestamps inside the trailing metrics window
    recent: VecDeque<Instant>,
    /// HTTP 429 responses reported against this key
    throttled_responses: u64,
}

impl TokenBucketInner {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) >= METRICS_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Token bucket rate limiter for a single key.
///
/// Tokens are consumed one per request and refilled at a constant rate up
/// to `capacity`. The bucket starts full, so the first `capacity` requests
/// pass immediately. Thread safety comes from the internal mutex: the
/// refill, check and decrement happen in one critical section.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum number of tokens in the bucket
    capacity: u32,
    /// Rate at which tokens are added (tokens per second)
    refill_rate: f64,
    inner: Mutex<TokenBucketInner>,
}

impl TokenBucket {
    /// Creates a new `TokenBucket`, initially full.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of tokens (burst size)
    /// * `refill_rate` - Tokens added per second
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            inner: Mutex::new(TokenBucketInner {
                tokens: capacity as f64,
                last_refill: Instant::now(),
                total_requests: 0,
                recent: VecDeque::new(),
                throttled_responses: 0,
            }),
        }
    }

    /// Adds the tokens accrued since the last refill, capped at capacity.
    fn refill(&self, inner: &mut TokenBucketInner, now: Instant) {
        let elapsed_secs = now.duration_since(inner.last_refill).as_secs_f64();

        if elapsed_secs > 0.0 {
            let new_tokens = elapsed_secs * self.refill_rate;
            inner.tokens = (inner.tokens + new_tokens).min(self.capacity as f64);
            inner.last_refill = now;
        }
    }

    /// Seconds until `deficit` tokens accrue, as a bounded sleep duration.
    fn wait_for(&self, deficit: f64) -> Duration {
        if self.refill_rate > 0.0 && self.refill_rate.is_finite() {
            Duration::from_secs_f64(deficit / self.refill_rate)
                .clamp(MIN_WAIT, MAX_WAIT)
        } else {
            MAX_WAIT
        }
    }

    /// Takes one token if available, otherwise reports how long to wait.
    ///
    /// A successful grant is recorded for metrics in the same critical
    /// section, so concurrent callers can never take the same token.
    fn take_or_wait(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        self.refill(&mut inner, now);

        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            inner.total_requests += 1;
            inner.recent.push_back(now);
            inner.prune(now);
            Ok(())
        } else {
            Err(self.wait_for(1.0 - inner.tokens))
        }
    }

    /// Attempts to acquire a single token without waiting.
    ///
    /// Returns `true` and consumes the token when at least one is available.
    pub fn try_acquire(&self) -> bool {
        self.take_or_wait().is_ok()
    }

    /// Returns the estimated wait until a token becomes available.
    ///
    /// Zero when tokens are already available.
    pub fn time_until_available(&self) -> Duration {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        self.refill(&mut inner, now);

        if inner.tokens >= 1.0 {
            Duration::ZERO
        } else {
            self.wait_for(1.0 - inner.tokens)
        }
    }

    /// Returns the current number of available tokens (after refill).
    pub fn available_tokens(&self) -> f64 {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        self.refill(&mut inner, now);
        inner.tokens
    }

    /// Returns the bucket capacity (burst size).
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns the refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn record_throttle(&self) {
        lock(&self.inner).throttled_responses += 1;
    }

    fn metrics(&self) -> RateLimitMetrics {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        inner.prune(now);
        RateLimitMetrics {
            total_requests: inner.total_requests,
            requests_per_minute: inner.recent.len() as u64,
            throttled_responses: inner.throttled_responses,
        }
    }
}

// ============================================================================
// RateLimitConfig
// ============================================================================

/// Configuration for the [`RateLimiter`].
///
/// Immutable once handed to a limiter. Use [`RateLimitConfig::new`] or
/// [`RateLimitConfig::from_settings`] to get range checks.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Tokens added per second to every bucket without an override
    pub requests_per_second: f64,
    /// Capacity of every bucket without an override
    pub burst_size: u32,
    /// Maximum number of retries on 429 and transient failures
    pub max_retries: u32,
    /// First retry delay; doubled on every further retry
    pub backoff_base: Duration,
    /// Upper bound for a single retry delay
    pub max_backoff: Duration,
    /// Per-key overrides: (requests_per_second, burst_size)
    pub key_overrides: HashMap<String, (f64, u32)>,
}

impl Default for RateLimitConfig {
    /// 3 requests per second with bursts of 10, matching the limits the
    /// browser extension applies against the same API.
    fn default() -> Self {
        Self {
            requests_per_second: 3.0,
            burst_size: 10,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            key_overrides: HashMap::new(),
        }
    }
}

fn check_bucket_params(label: &str, rate: f64, burst: u32) -> Result<(), ThrottleError> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(ThrottleError::InvalidConfig(format!(
            "{label}: requests_per_second must be a finite number greater than 0, got {rate}"
        )));
    }
    if burst == 0 {
        return Err(ThrottleError::InvalidConfig(format!(
            "{label}: burst_size must be at least 1"
        )));
    }
    Ok(())
}

impl RateLimitConfig {
    /// Creates a validated configuration with default backoff settings.
    ///
    /// # Errors
    /// `InvalidConfig` when the rate is not a positive finite number or the
    /// burst size is zero.
    pub fn new(
        requests_per_second: f64,
        burst_size: u32,
        max_retries: u32,
    ) -> Result<Self, ThrottleError> {
        let config = Self {
            requests_per_second,
            burst_size,
            max_retries,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from the YAML `rate_limiting` section.
    pub fn from_settings(settings: &RateLimitingConfig) -> Result<Self, ThrottleError> {
        let config = Self {
            requests_per_second: settings.requests_per_second,
            burst_size: settings.burst_size,
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            key_overrides: settings
                .key_overrides
                .iter()
                .map(|(key, ov)| (key.clone(), (ov.requests_per_second, ov.burst_size)))
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Adds bucket parameters for one key.
    pub fn with_key_override(
        mut self,
        key: impl Into<String>,
        requests_per_second: f64,
        burst_size: u32,
    ) -> Result<Self, ThrottleError> {
        let key = key.into();
        check_bucket_params(&key, requests_per_second, burst_size)?;
        self.key_overrides
            .insert(key, (requests_per_second, burst_size));
        Ok(self)
    }

    /// Replaces the retry backoff parameters.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max.max(base);
        self
    }

    /// Checks every rate and burst size in the configuration.
    pub fn validate(&self) -> Result<(), ThrottleError> {
        check_bucket_params("default", self.requests_per_second, self.burst_size)?;
        for (key, (rate, burst)) in &self.key_overrides {
            check_bucket_params(key, *rate, *burst)?;
        }
        Ok(())
    }

    /// Bucket parameters for `key`: its override or the defaults.
    fn bucket_params(&self, key: &str) -> (f64, u32) {
        self.key_overrides
            .get(key)
            .copied()
            .unwrap_or((self.requests_per_second, self.burst_size))
    }
}

// ============================================================================
// RateLimitMetrics
// ============================================================================

/// Usage counters for one key, or summed over all keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitMetrics {
    /// Tokens granted since the bucket was created
    pub total_requests: u64,
    /// Tokens granted during the trailing 60 seconds
    pub requests_per_minute: u64,
    /// HTTP 429 responses reported for the key
    pub throttled_responses: u64,
}

impl std::ops::Add for RateLimitMetrics {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            total_requests: self.total_requests + other.total_requests,
            requests_per_minute: self.requests_per_minute + other.requests_per_minute,
            throttled_responses: self.throttled_responses + other.throttled_responses,
        }
    }
}

// ============================================================================
// RateLimiter
// ============================================================================

/// Keyed rate limiter managing one [`TokenBucket`] per resource key.
///
/// Buckets are created lazily on first use and share no state with each
/// other. Designed to be shared via `Arc<RateLimiter>`.
pub struct RateLimiter {
    /// Per-key token buckets
    buckets: DashMap<String, TokenBucket>,
    /// Configuration for bucket creation and retry behaviour
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("keys", &self.buckets.len())
            .finish()
    }
}

impl RateLimiter {
    /// Creates a new `RateLimiter` with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Creates a new `RateLimiter` with [`RateLimitConfig::default`].
    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Returns the configuration the limiter was built with.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Returns the maximum number of retries configured.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Runs `f` against the bucket for `key`, creating it if needed.
    ///
    /// The map guard is released before returning, so callers never hold
    /// it across an await point.
    fn with_bucket<F, R>(&self, key: &str, f: F) -> R
    where
        F: FnOnce(&TokenBucket) -> R,
    {
        if let Some(bucket) = self.buckets.get(key) {
            return f(&bucket);
        }

        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            let (refill_rate, capacity) = self.config.bucket_params(key);
            debug!(key, capacity, refill_rate, "Creating new token bucket for key");
            TokenBucket::new(capacity, refill_rate)
        });
        f(&bucket)
    }

    /// Acquires a token for `key`, waiting for refill when the bucket is empty.
    ///
    /// The wait is computed from the token deficit and the refill rate, and
    /// spent in `tokio::time::sleep`, so other tasks keep running. Never fails.
    pub async fn acquire(&self, key: &str) {
        loop {
            match self.with_bucket(key, TokenBucket::take_or_wait) {
                Ok(()) => {
                    debug!(key, "Rate limit token acquired");
                    return;
                }
                Err(wait) => {
                    debug!(
                        key,
                        wait_ms = wait.as_millis() as u64,
                        "No tokens available, waiting for refill"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Takes a token for `key` only if one is available right now.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.with_bucket(key, TokenBucket::try_acquire)
    }

    /// Records an HTTP 429 response against `key`.
    pub fn record_throttle(&self, key: &str) {
        warn!(key, "Throttled response recorded");
        self.with_bucket(key, TokenBucket::record_throttle);
    }

    /// Returns usage metrics for `key`, or summed over all keys for `None`.
    ///
    /// Unknown keys yield zeroed metrics and do not create a bucket.
    pub fn get_metrics(&self, key: Option<&str>) -> RateLimitMetrics {
        match key {
            Some(key) => self
                .buckets
                .get(key)
                .map(|bucket| bucket.metrics())
                .unwrap_or_default(),
            None => self
                .buckets
                .iter()
                .map(|entry| entry.value().metrics())
                .fold(RateLimitMetrics::default(), |acc, m| acc + m),
        }
    }

    /// Returns metrics for every known key, sorted by key.
    pub fn all_metrics(&self) -> Vec<(String, RateLimitMetrics)> {
        let mut all: Vec<_> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Returns the current available tokens for `key`.
    ///
    /// Returns `None` if no bucket exists for the key yet.
    pub fn available_tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|b| b.available_tokens())
    }

    /// Returns the keys that have a bucket, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.buckets.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

// ============================================================================
// Retry-After header parsing
// ============================================================================

/// Longest server-requested delay that is honoured
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parses a Retry-After header value into a Duration.
///
/// The header can be either:
/// - An integer number of seconds (e.g., "30")
/// - An HTTP-date (e.g., "Fri, 31 Dec 2025 23:59:59 GMT"), taken as seconds from now
///
/// Returns `None` when the value cannot be parsed or lies more than an hour out.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = match value.trim().parse::<u64>() {
        Ok(seconds) => seconds,
        Err(_) => {
            let date = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
            let diff = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
            diff.num_seconds().max(0).try_into().ok()?
        }
    };

    let delay = Duration::from_secs(secs);
    if delay <= MAX_RETRY_AFTER {
        Some(delay)
    } else {
        warn!(value, "Ignoring Retry-After more than an hour away");
        None
    }
}
