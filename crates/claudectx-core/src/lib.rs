//! claudectx Core - Shared configuration
//!
//! This crate holds the typed YAML configuration consumed by the other
//! claudectx crates:
//! - **Rate limiting** - token bucket rate, burst, retry and backoff settings
//! - **Queues** - default and per-queue concurrency caps
//! - **HTTP** - user agent and request timeout for outbound calls
//! - **Logging** - default tracing level
//!
//! The throttle crate converts these plain settings into its runtime types,
//! so this crate carries no async or HTTP dependencies.

pub mod config;

pub use config::{Config, ConfigBuilder, ValidationError};
