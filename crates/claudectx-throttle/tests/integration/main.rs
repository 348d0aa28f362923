//! Integration tests for claudectx-throttle
//!
//! Exercises the queue manager and rate limiter under a paused Tokio clock,
//! and uses wiremock to simulate a throttling API for the session.

mod common;

mod test_pipeline;
mod test_queue;
mod test_rate_limiter;
mod test_session;
