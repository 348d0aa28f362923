//! Rate-limited HTTP session
//!
//! [`RateLimitedSession`] wraps a `reqwest::Client` so that every attempt
//! first takes a token from the shared [`RateLimiter`], and HTTP 429 or
//! transient transport failures are retried with exponential backoff.

use std::{sync::Arc, time::Duration};

use claudectx_core::config::HttpConfig;
use reqwest::{header::USER_AGENT, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    rate_limit::{parse_retry_after, RateLimiter, DEFAULT_KEY, MAX_RETRY_AFTER},
    ThrottleError,
};

/// User-Agent sent when none is configured
pub const DEFAULT_USER_AGENT: &str = concat!("claudectx/", env!("CARGO_PKG_VERSION"));

/// HTTP client whose requests pass through a keyed rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitedSession {
    /// The underlying HTTP client
    client: Client,
    /// Shared limiter; also supplies retry and backoff settings
    limiter: Arc<RateLimiter>,
    /// Limiter key charged for every attempt
    key: String,
    user_agent: String,
}

impl RateLimitedSession {
    /// Creates a session charging the default limiter key.
    pub fn new(client: Client, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            limiter,
            key: DEFAULT_KEY.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Builds the client from the YAML `http` section.
    pub fn from_settings(
        settings: &HttpConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, ThrottleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self::new(client, limiter).with_user_agent(settings.user_agent.clone()))
    }

    /// Charges `key` instead of the default key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Creates a request builder carrying the session's User-Agent.
    ///
    /// Requests sent straight from the builder bypass the limiter.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(USER_AGENT, &self.user_agent)
    }

    /// Sends a GET request through the limiter.
    pub async fn get(&self, url: &str) -> Result<Response, ThrottleError> {
        self.execute(Method::GET, url).await
    }

    /// Sends a POST request with a JSON body through the limiter.
    pub async fn post_json<B>(&self, url: &str, body: &B) -> Result<Response, ThrottleError>
    where
        B: Serialize + ?Sized,
    {
        self.send_with_retry(url, || self.request(Method::POST, url).json(body))
            .await
    }

    /// Sends a body-less request with any method through the limiter.
    pub async fn execute(&self, method: Method, url: &str) -> Result<Response, ThrottleError> {
        self.send_with_retry(url, || self.request(method.clone(), url))
            .await
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// `backoff_base * 2^attempt`, capped at `max_backoff`, and never shorter
    /// than a server-provided Retry-After. Retry-After itself is capped at
    /// [`MAX_RETRY_AFTER`].
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let config = self.limiter.config();
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exponential = config
            .backoff_base
            .saturating_mul(factor)
            .min(config.max_backoff);
        let requested = retry_after.unwrap_or_default().min(MAX_RETRY_AFTER);
        exponential.max(requested)
    }

    /// Runs the acquire / send / backoff loop for requests built by `build`.
    ///
    /// Statuses other than 429 are returned to the caller untouched.
    ///
    /// # Errors
    /// - `RetriesExhausted` when 429s or transient failures outlast `max_retries`
    /// - `Network` for any other transport error
    pub async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Response, ThrottleError>
    where
        F: Fn() -> RequestBuilder,
    {
        let max_retries = self.limiter.max_retries();
        let mut attempt = 0u32;

        loop {
            self.limiter.acquire(&self.key).await;

            let (reason, retry_after) = match build().send().await {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    self.limiter.record_throttle(&self.key);
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    ("HTTP 429 Too Many Requests".to_string(), retry_after)
                }
                Ok(response) => {
                    if attempt > 0 {
                        info!(url, attempt, "Request succeeded after retry");
                    }
                    debug!(url, status = response.status().as_u16(), "Response received");
                    return Ok(response);
                }
                Err(e) if e.is_timeout() || e.is_connect() => (e.to_string(), None),
                Err(e) => return Err(ThrottleError::Network(e)),
            };

            if attempt >= max_retries {
                warn!(url, attempts = attempt + 1, %reason, "Retry limit exhausted");
                return Err(ThrottleError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: attempt + 1,
                    reason,
                    retry_after,
                });
            }

            let delay = self.backoff_delay(attempt, retry_after);
            info!(
                url,
                attempt,
                %reason,
                delay_ms = delay.as_millis() as u64,
                "Request throttled or failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
