//! Configuration module for claudectx.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for claudectx.
///
/// Every section is optional in the YAML file; missing sections and fields
/// fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rate_limiting: RateLimitingConfig,
    pub queues: QueuesConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Token bucket settings for outbound requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Tokens added to each bucket per second.
    pub requests_per_second: f64,
    /// Bucket capacity, i.e. how many requests may be issued back to back.
    pub burst_size: u32,
    /// How many times a throttled (429) or transient failure is retried.
    pub max_retries: u32,
    /// First backoff delay in milliseconds; doubled on every retry.
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Per-key bucket parameters, e.g. a slower bucket for `conversations`.
    pub key_overrides: BTreeMap<String, KeyOverride>,
}

/// Bucket parameters for one named rate-limit key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyOverride {
    pub requests_per_second: f64,
    pub burst_size: u32,
}

/// Request queue concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// In-flight cap applied to every queue without an override.
    pub default_max_concurrent: usize,
    /// Per-queue in-flight caps, e.g. `sync: 1` for background work.
    pub overrides: BTreeMap<String, usize>,
}

/// Outbound HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/claudectx/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("claudectx")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 3.0,
            burst_size: 10,
            max_retries: 3,
            backoff_base_ms: 1_000,
            max_backoff_ms: 60_000,
            key_overrides: BTreeMap::new(),
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: 3,
            overrides: BTreeMap::new(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("claudectx/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"rate_limiting.burst_size"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn is_valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- rate_limiting ---
        let rl = &self.rate_limiting;
        if !is_valid_rate(rl.requests_per_second) {
            errors.push(ValidationError {
                field: "rate_limiting.requests_per_second".into(),
                message: format!(
                    "must be a finite number greater than 0 (got {})",
                    rl.requests_per_second
                ),
            });
        }
        if rl.burst_size == 0 {
            errors.push(ValidationError {
                field: "rate_limiting.burst_size".into(),
                message: "must be at least 1".into(),
            });
        }
        if rl.backoff_base_ms == 0 {
            errors.push(ValidationError {
                field: "rate_limiting.backoff_base_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if rl.max_backoff_ms < rl.backoff_base_ms {
            errors.push(ValidationError {
                field: "rate_limiting.max_backoff_ms".into(),
                message: format!(
                    "max_backoff_ms ({}) must not be below backoff_base_ms ({})",
                    rl.max_backoff_ms, rl.backoff_base_ms
                ),
            });
        }
        for (key, ov) in &rl.key_overrides {
            if !is_valid_rate(ov.requests_per_second) {
                errors.push(ValidationError {
                    field: format!("rate_limiting.key_overrides.{key}.requests_per_second"),
                    message: "must be a finite number greater than 0".into(),
                });
            }
            if ov.burst_size == 0 {
                errors.push(ValidationError {
                    field: format!("rate_limiting.key_overrides.{key}.burst_size"),
                    message: "must be at least 1".into(),
                });
            }
        }

        // --- queues ---
        if self.queues.default_max_concurrent == 0 {
            errors.push(ValidationError {
                field: "queues.default_max_concurrent".into(),
                message: "must be greater than 0".into(),
            });
        }
        for (name, cap) in &self.queues.overrides {
            if *cap == 0 {
                errors.push(ValidationError {
                    field: format!("queues.overrides.{name}"),
                    message: "must be greater than 0".into(),
                });
            }
        }

        // --- http ---
        if self.http.timeout_secs == 0 {
            errors.push(ValidationError {
                field: "http.timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.http.user_agent.trim().is_empty() {
            errors.push(ValidationError {
                field: "http.user_agent".into(),
                message: "must not be empty".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use claudectx_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .requests_per_second(3.0)
///     .burst_size(5)
///     .queue_override("sync", 1)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- rate_limiting ---

    pub fn requests_per_second(mut self, rate: f64) -> Self {
        self.config.rate_limiting.requests_per_second = rate;
        self
    }

    pub fn burst_size(mut self, burst: u32) -> Self {
        self.config.rate_limiting.burst_size = burst;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.rate_limiting.max_retries = retries;
        self
    }

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.config.rate_limiting.backoff_base_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.rate_limiting.max_backoff_ms = ms;
        self
    }

    pub fn key_override(
        mut self,
        key: impl Into<String>,
        requests_per_second: f64,
        burst_size: u32,
    ) -> Self {
        self.config.rate_limiting.key_overrides.insert(
            key.into(),
            KeyOverride {
                requests_per_second,
                burst_size,
            },
        );
        self
    }

    // --- queues ---

    pub fn default_max_concurrent(mut self, n: usize) -> Self {
        self.config.queues.default_max_concurrent = n;
        self
    }

    pub fn queue_override(mut self, name: impl Into<String>, max_concurrent: usize) -> Self {
        self.config.queues.overrides.insert(name.into(), max_concurrent);
        self
    }

    // --- http ---

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.http.user_agent = agent.into();
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.http.timeout_secs = secs;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
