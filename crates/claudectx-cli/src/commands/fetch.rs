//! Fetch command - download URLs through the queue and the limiter
//!
//! Every URL becomes a queued unit of work at the requested priority; the
//! work performs a rate-limited GET with 429 backoff and reports its status.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use claudectx_core::config::Config;
use claudectx_telemetry::MetricsRegistry;
use claudectx_throttle::{
    QueueMetrics, RateLimitConfig, RateLimitMetrics, RateLimitedSession, RateLimiter,
    RequestPriority, RequestQueueManager, DEFAULT_KEY, DEFAULT_QUEUE,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{format_secs, print_limiter_metrics, print_queue_metrics, CliContext};

/// Arguments for the fetch subcommand
#[derive(Debug, clap::Args)]
pub struct FetchCommand {
    /// URLs to fetch
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Priority of the queued requests (low, normal, high, critical or 0-3)
    #[arg(short, long, default_value = "normal")]
    pub priority: RequestPriority,

    /// Queue to submit the requests to
    #[arg(long, default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Rate limit key charged for the requests
    #[arg(long, default_value = DEFAULT_KEY)]
    pub key: String,

    /// Print metrics in Prometheus exposition format
    #[arg(long)]
    pub prometheus: bool,
}

/// Result of fetching one URL
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub url: String,
    pub status: Option<u16>,
    pub bytes: Option<usize>,
    pub duration_secs: f64,
    pub error: Option<String>,
}

/// Everything a fetch run produced
#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub reports: Vec<FetchReport>,
    pub queue: QueueMetrics,
    pub limiter: RateLimitMetrics,
    #[serde(skip)]
    pub prometheus: String,
}

impl FetchCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = ctx.load_config()?;

        let summary = run_fetch(&config, &self.urls, self.priority, &self.queue, &self.key).await?;

        if self.prometheus {
            print!("{}", summary.prometheus);
            return Ok(());
        }

        if ctx.format.is_json() {
            let json = serde_json::to_value(&summary).context("Failed to serialize results")?;
            formatter.print_json(&json);
            return Ok(());
        }

        for report in &summary.reports {
            match (&report.status, &report.error) {
                (Some(status), _) => formatter.success(&format!(
                    "{} {} ({} bytes, {})",
                    status,
                    report.url,
                    report.bytes.unwrap_or_default(),
                    format_secs(Duration::from_secs_f64(report.duration_secs))
                )),
                (None, Some(error)) => formatter.error(&format!("{}: {}", report.url, error)),
                (None, None) => formatter.warn(&format!("{}: no result", report.url)),
            }
        }
        formatter.info("");
        print_queue_metrics(formatter.as_ref(), &self.queue, &summary.queue);
        print_limiter_metrics(formatter.as_ref(), &self.key, &summary.limiter);
        Ok(())
    }
}

/// Fetches `urls` through a queue manager and a rate-limited session built
/// from `config`, returning per-URL reports and the final metrics.
pub async fn run_fetch(
    config: &Config,
    urls: &[String],
    priority: RequestPriority,
    queue: &str,
    key: &str,
) -> Result<FetchSummary> {
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::from_settings(&config.rate_limiting)
            .context("Invalid rate limiting settings")?,
    ));
    let session = RateLimitedSession::from_settings(&config.http, Arc::clone(&limiter))
        .context("Failed to build HTTP client")?
        .with_key(key);
    let manager =
        RequestQueueManager::from_settings(&config.queues).context("Invalid queue settings")?;
    let registry = Arc::new(MetricsRegistry::new()?);

    info!(count = urls.len(), %priority, queue, key, "Fetching URLs");
    manager.start()?;

    let mut handles = Vec::with_capacity(urls.len());
    for url in urls {
        let session = session.clone();
        let registry = Arc::clone(&registry);
        let url = url.clone();
        let queue_name = queue.to_string();
        let handle = manager.enqueue(
            move || async move {
                let started = Instant::now();
                let result = async {
                    let response = session.get(&url).await?;
                    let status = response.status().as_u16();
                    let body = response.bytes().await?;
                    Ok::<_, anyhow::Error>((status, body.len()))
                }
                .await;
                let elapsed = started.elapsed();

                let report = match result {
                    Ok((status, bytes)) => {
                        registry.observe_request_duration(&queue_name, "ok", elapsed.as_secs_f64());
                        FetchReport {
                            url,
                            status: Some(status),
                            bytes: Some(bytes),
                            duration_secs: elapsed.as_secs_f64(),
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(url = %url, error = %format!("{e:#}"), "Fetch failed");
                        registry.observe_request_duration(
                            &queue_name,
                            "error",
                            elapsed.as_secs_f64(),
                        );
                        FetchReport {
                            url,
                            status: None,
                            bytes: None,
                            duration_secs: elapsed.as_secs_f64(),
                            error: Some(format!("{e:#}")),
                        }
                    }
                };
                Ok::<_, anyhow::Error>(report)
            },
            priority,
            queue,
        )?;
        handles.push(handle);
    }

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        reports.push(handle.await?);
    }
    manager.stop().await;

    registry.observe_limiter(&limiter);
    registry.observe_queues(&manager);

    Ok(FetchSummary {
        reports,
        queue: manager.metrics(queue),
        limiter: limiter.get_metrics(Some(key)),
        prometheus: registry.encode()?,
    })
}
