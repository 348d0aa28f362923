//! claudectx Telemetry - Prometheus exposition
//!
//! Provides `MetricsRegistry`, which snapshots rate limiter and request
//! queue metrics into Prometheus collectors and encodes them in the text
//! exposition format.

pub mod metrics;

pub use metrics::MetricsRegistry;
