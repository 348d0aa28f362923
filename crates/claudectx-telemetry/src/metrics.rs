//! Prometheus metrics registry for claudectx
//!
//! Mirrors the rate limiter's per-key counters and the queue manager's
//! per-queue counters into labeled Prometheus collectors. Cumulative values
//! are exported as counters advanced to the latest snapshot; current state
//! (backlog, in-flight, tokens, averages) as gauges.

use claudectx_throttle::{RateLimiter, RequestQueueManager};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tracing::debug;

/// Advances a counter to `target`; counters never move backwards.
fn advance_to(counter: &IntCounterVec, labels: &[&str], target: u64) {
    let counter = counter.with_label_values(labels);
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

/// Central metrics registry holding all Prometheus metrics.
pub struct MetricsRegistry {
    registry: Registry,
    /// Counter: tokens granted per limiter key
    pub rate_limit_requests_total: IntCounterVec,
    /// Counter: HTTP 429 responses per limiter key
    pub rate_limit_throttled_total: IntCounterVec,
    /// Gauge: grants in the trailing minute per limiter key
    pub rate_limit_requests_per_minute: IntGaugeVec,
    /// Gauge: tokens currently available per limiter key
    pub rate_limit_available_tokens: GaugeVec,
    /// Counter: queue entries by (queue, outcome)
    pub queue_requests_total: IntCounterVec,
    /// Gauge: entries waiting per queue
    pub queue_backlog: IntGaugeVec,
    /// Gauge: entries running per queue
    pub queue_in_flight: IntGaugeVec,
    /// Gauge: concurrency cap per queue
    pub queue_max_concurrent: IntGaugeVec,
    /// Gauge: average enqueue-to-resolution latency per queue
    pub queue_avg_latency_seconds: GaugeVec,
    /// Gauge: average enqueue-to-dispatch wait per queue
    pub queue_avg_wait_seconds: GaugeVec,
    /// Histogram: duration of individual requests by (queue, result)
    pub request_duration_seconds: HistogramVec,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with all metrics registered.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("claudectx".to_string()), None)?;

        let rate_limit_requests_total = IntCounterVec::new(
            Opts::new("rate_limit_requests_total", "Tokens granted by the rate limiter"),
            &["key"],
        )?;
        registry.register(Box::new(rate_limit_requests_total.clone()))?;

        let rate_limit_throttled_total = IntCounterVec::new(
            Opts::new("rate_limit_throttled_total", "HTTP 429 responses received"),
            &["key"],
        )?;
        registry.register(Box::new(rate_limit_throttled_total.clone()))?;

        let rate_limit_requests_per_minute = IntGaugeVec::new(
            Opts::new(
                "rate_limit_requests_per_minute",
                "Tokens granted during the trailing minute",
            ),
            &["key"],
        )?;
        registry.register(Box::new(rate_limit_requests_per_minute.clone()))?;

        let rate_limit_available_tokens = GaugeVec::new(
            Opts::new("rate_limit_available_tokens", "Tokens currently in the bucket"),
            &["key"],
        )?;
        registry.register(Box::new(rate_limit_available_tokens.clone()))?;

        let queue_requests_total = IntCounterVec::new(
            Opts::new("queue_requests_total", "Queue entries by outcome"),
            &["queue", "outcome"],
        )?;
        registry.register(Box::new(queue_requests_total.clone()))?;

        let queue_backlog = IntGaugeVec::new(
            Opts::new("queue_backlog", "Entries waiting for dispatch"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_backlog.clone()))?;

        let queue_in_flight = IntGaugeVec::new(
            Opts::new("queue_in_flight", "Entries currently running"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_in_flight.clone()))?;

        let queue_max_concurrent = IntGaugeVec::new(
            Opts::new("queue_max_concurrent", "Concurrency cap of the queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_max_concurrent.clone()))?;

        let queue_avg_latency_seconds = GaugeVec::new(
            Opts::new(
                "queue_avg_latency_seconds",
                "Average time from enqueue to resolution",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(queue_avg_latency_seconds.clone()))?;

        let queue_avg_wait_seconds = GaugeVec::new(
            Opts::new("queue_avg_wait_seconds", "Average time from enqueue to dispatch"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_avg_wait_seconds.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request duration in seconds")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, f64::INFINITY]),
            &["queue", "result"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            rate_limit_requests_total,
            rate_limit_throttled_total,
            rate_limit_requests_per_minute,
            rate_limit_available_tokens,
            queue_requests_total,
            queue_backlog,
            queue_in_flight,
            queue_max_concurrent,
            queue_avg_latency_seconds,
            queue_avg_wait_seconds,
            request_duration_seconds,
        })
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Copy the limiter's per-key metrics into the registry.
    pub fn observe_limiter(&self, limiter: &RateLimiter) {
        let all = limiter.all_metrics();
        debug!(keys = all.len(), "Observing rate limiter");

        for (key, metrics) in all {
            let labels = [key.as_str()];
            advance_to(&self.rate_limit_requests_total, &labels, metrics.total_requests);
            advance_to(
                &self.rate_limit_throttled_total,
                &labels,
                metrics.throttled_responses,
            );
            self.rate_limit_requests_per_minute
                .with_label_values(&labels)
                .set(metrics.requests_per_minute as i64);
            if let Some(tokens) = limiter.available_tokens(&key) {
                self.rate_limit_available_tokens
                    .with_label_values(&labels)
                    .set(tokens);
            }
        }
    }

    /// Copy every queue's metrics into the registry.
    pub fn observe_queues(&self, manager: &RequestQueueManager) {
        let all = manager.get_all_metrics();
        debug!(queues = all.len(), "Observing request queues");

        for (queue, metrics) in &all {
            let name = queue.as_str();
            for (outcome, value) in [
                ("enqueued", metrics.total_enqueued),
                ("completed", metrics.completed),
                ("failed", metrics.failed),
                ("cancelled", metrics.cancelled),
            ] {
                advance_to(&self.queue_requests_total, &[name, outcome], value);
            }
            self.queue_backlog
                .with_label_values(&[name])
                .set(metrics.backlog as i64);
            self.queue_in_flight
                .with_label_values(&[name])
                .set(metrics.in_flight as i64);
            self.queue_max_concurrent
                .with_label_values(&[name])
                .set(metrics.max_concurrent as i64);
            self.queue_avg_latency_seconds
                .with_label_values(&[name])
                .set(metrics.avg_latency_ms / 1000.0);
            self.queue_avg_wait_seconds
                .with_label_values(&[name])
                .set(metrics.avg_wait_ms / 1000.0);
        }
    }

    /// Observe the duration of one request.
    pub fn observe_request_duration(&self, queue: &str, result: &str, duration_secs: f64) {
        self.request_duration_seconds
            .with_label_values(&[queue, result])
            .observe(duration_secs);
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
