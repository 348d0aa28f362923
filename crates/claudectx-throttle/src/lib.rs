//! claudectx Throttle - outbound request admission and scheduling
//!
//! Provides the concurrency layer used by bulk exports and backups:
//! - Token bucket rate limiting per resource key
//! - A priority-ordered, concurrency-capped request queue manager
//! - A rate-limited HTTP session with exponential backoff on 429s
//!
//! ## Modules
//!
//! - [`rate_limit`] - Token buckets, the keyed [`RateLimiter`] and its metrics
//! - [`priority`] - [`RequestPriority`] levels and the backlog ordering
//! - [`queue`] - [`RequestQueueManager`], its dispatch loop and handles
//! - [`session`] - [`RateLimitedSession`] wrapping `reqwest::Client`

pub mod priority;
pub mod queue;
pub mod rate_limit;
pub mod session;

use std::time::Duration;

use thiserror::Error;

pub use priority::RequestPriority;
pub use queue::{QueueMetrics, RequestHandle, RequestQueueManager, DEFAULT_QUEUE};
pub use rate_limit::{RateLimitConfig, RateLimitMetrics, RateLimiter, DEFAULT_KEY};
pub use session::RateLimitedSession;

/// Errors surfaced by the limiter, the queue manager and the session
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// A limiter or queue setting is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A priority name or level could not be parsed
    #[error("Invalid priority: {0}")]
    InvalidPriority(String),

    /// The queue manager has been stopped and accepts no more work
    #[error("Request queue is closed")]
    QueueClosed,

    /// The entry was removed from the backlog before it was dispatched
    #[error("Request was cancelled before dispatch")]
    Cancelled,

    /// The work closure returned an error
    #[error("Request failed: {0:#}")]
    WorkFailed(anyhow::Error),

    /// The work closure panicked while running
    #[error("Request panicked: {0}")]
    WorkPanicked(String),

    /// Throttling or transient failures persisted through every retry
    #[error("Retries exhausted after {attempts} attempts for {url}: {reason}")]
    RetriesExhausted {
        /// Target URL of the request
        url: String,
        /// Number of attempts made, including the first one
        attempts: u32,
        /// Last failure observed
        reason: String,
        /// Server-provided delay on the last 429, if any
        retry_after: Option<Duration>,
    },

    /// A non-transient network-level error occurred
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}
