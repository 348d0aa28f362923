//! Throttle command - exercise the rate limiter against one key
//!
//! Issues a number of `acquire()` calls back to back and reports when each
//! token was granted, showing the burst followed by steady-state pacing.

use std::time::Duration;

use anyhow::{Context, Result};
use claudectx_throttle::{RateLimitConfig, RateLimitMetrics, RateLimiter, DEFAULT_KEY};
use tokio::time::Instant;
use tracing::info;

use super::{format_secs, print_limiter_metrics, CliContext};

/// Arguments for the throttle subcommand
#[derive(Debug, clap::Args)]
pub struct ThrottleCommand {
    /// Rate limit key to draw tokens from
    #[arg(long, default_value = DEFAULT_KEY)]
    pub key: String,

    /// Number of tokens to acquire
    #[arg(short = 'n', long, default_value_t = 10)]
    pub count: u32,

    /// Override rate_limiting.requests_per_second
    #[arg(long)]
    pub rps: Option<f64>,

    /// Override rate_limiting.burst_size
    #[arg(long)]
    pub burst: Option<u32>,
}

impl ThrottleCommand {
    /// Resolve the limiter settings from config plus command-line overrides.
    fn limiter_config(&self, ctx: &CliContext) -> Result<RateLimitConfig> {
        let mut settings = ctx.load_config()?.rate_limiting;
        if let Some(rps) = self.rps {
            settings.requests_per_second = rps;
        }
        if let Some(burst) = self.burst {
            settings.burst_size = burst;
        }
        RateLimitConfig::from_settings(&settings).context("Invalid rate limiting settings")
    }

    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = self.limiter_config(ctx)?;

        info!(
            key = %self.key,
            count = self.count,
            rps = config.requests_per_second,
            burst = config.burst_size,
            "Running throttle demonstration"
        );

        let (grants, metrics) = run_throttle(config.clone(), &self.key, self.count).await;

        if ctx.format.is_json() {
            let json = serde_json::json!({
                "key": self.key,
                "requests_per_second": config.requests_per_second,
                "burst_size": config.burst_size,
                "grants_secs": grants.iter().map(Duration::as_secs_f64).collect::<Vec<_>>(),
                "metrics": metrics,
            });
            formatter.print_json(&json);
            return Ok(());
        }

        formatter.success(&format!(
            "Acquired {} tokens for '{}' ({} req/s, burst {})",
            self.count, self.key, config.requests_per_second, config.burst_size
        ));
        let mut previous = Duration::ZERO;
        for (i, grant) in grants.iter().enumerate() {
            formatter.info(&format!(
                "#{:<3} at {:>8}  (+{})",
                i + 1,
                format_secs(*grant),
                format_secs(grant.saturating_sub(previous))
            ));
            previous = *grant;
        }
        formatter.info("");
        print_limiter_metrics(formatter.as_ref(), &self.key, &metrics);
        Ok(())
    }
}

/// Acquires `count` tokens for `key`, returning the offset of every grant.
pub async fn run_throttle(
    config: RateLimitConfig,
    key: &str,
    count: u32,
) -> (Vec<Duration>, RateLimitMetrics) {
    let limiter = RateLimiter::new(config);
    let start = Instant::now();
    let mut grants = Vec::with_capacity(count as usize);

    for _ in 0..count {
        limiter.acquire(key).await;
        grants.push(start.elapsed());
    }

    (grants, limiter.get_metrics(Some(key)))
}
