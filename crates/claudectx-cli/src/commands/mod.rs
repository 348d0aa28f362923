//! Subcommand implementations and the context they share

pub mod completions;
pub mod config;
pub mod fetch;
pub mod queue;
pub mod throttle;

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use claudectx_core::config::Config;
use claudectx_throttle::{QueueMetrics, RateLimitMetrics};

use crate::output::{get_formatter, OutputFormat, OutputFormatter};

/// Global flags resolved once in `main` and handed to every command
#[derive(Debug, Clone)]
pub struct CliContext {
    pub format: OutputFormat,
    pub quiet: bool,
    /// Path given with `--config`, if any
    pub explicit_config: Option<PathBuf>,
}

impl CliContext {
    /// The file commands read and write: `--config` or the default path.
    pub fn config_path(&self) -> PathBuf {
        self.explicit_config
            .clone()
            .unwrap_or_else(Config::default_path)
    }

    /// Reads the configuration without validating it.
    ///
    /// A file named with `--config` must exist and parse; the default file
    /// falls back to built-in defaults when missing.
    pub fn read_config(&self) -> Result<Config> {
        match &self.explicit_config {
            Some(path) => Config::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display())),
            None => Ok(Config::load_or_default(&Config::default_path())),
        }
    }

    /// Reads the configuration and rejects it if any field is invalid.
    pub fn load_config(&self) -> Result<Config> {
        let config = self.read_config()?;
        let errors = config.validate();
        if !errors.is_empty() {
            let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
            bail!(
                "Invalid configuration in {}: {}",
                self.config_path().display(),
                details.join("; ")
            );
        }
        Ok(config)
    }

    pub fn formatter(&self) -> Box<dyn OutputFormatter> {
        get_formatter(self.format, self.quiet)
    }
}

pub(crate) fn format_secs(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

pub(crate) fn print_limiter_metrics(
    formatter: &dyn OutputFormatter,
    key: &str,
    metrics: &RateLimitMetrics,
) {
    formatter.section(&format!("Rate limiter [{key}]"));
    formatter.field("total requests", &metrics.total_requests.to_string());
    formatter.field("requests per minute", &metrics.requests_per_minute.to_string());
    formatter.field("throttled (429)", &metrics.throttled_responses.to_string());
}

pub(crate) fn print_queue_metrics(formatter: &dyn OutputFormatter, name: &str, m: &QueueMetrics) {
    formatter.section(&format!("Queue [{name}] (max {} concurrent)", m.max_concurrent));
    formatter.field("enqueued", &m.total_enqueued.to_string());
    formatter.field("completed", &m.completed.to_string());
    formatter.field("failed", &m.failed.to_string());
    formatter.field("cancelled", &m.cancelled.to_string());
    formatter.field("backlog / in flight", &format!("{} / {}", m.backlog, m.in_flight));
    formatter.field("avg latency", &format!("{:.1} ms", m.avg_latency_ms));
    formatter.field("avg wait", &format!("{:.1} ms", m.avg_wait_ms));
}
