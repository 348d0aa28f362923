//! Config command - View and manage claudectx configuration
//!
//! Provides the `claudectx config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON)
//! 2. Prints the path of the configuration file in use
//! 3. Sets individual values via dot-notation keys
//! 4. Validates the configuration file and reports every error

use anyhow::{Context, Result};
use clap::Subcommand;
use claudectx_core::config::Config;
use tracing::info;

use super::CliContext;

/// Config subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Set a configuration value
    Set {
        /// Configuration key (e.g., "rate_limiting.burst_size")
        key: String,
        /// New value
        value: String,
    },
    /// Validate the configuration file
    Validate,
}

/// Keys accepted by `config set`, with a short description
const SUPPORTED_KEYS: &[(&str, &str)] = &[
    ("rate_limiting.requests_per_second", "Tokens added per second"),
    ("rate_limiting.burst_size", "Bucket capacity"),
    ("rate_limiting.max_retries", "Retries on 429 and transient errors"),
    ("rate_limiting.backoff_base_ms", "First backoff delay (ms)"),
    ("rate_limiting.max_backoff_ms", "Backoff cap (ms)"),
    ("queues.default_max_concurrent", "In-flight cap per queue"),
    ("queues.overrides.<name>", "In-flight cap for one queue"),
    ("http.user_agent", "User-Agent header"),
    ("http.timeout_secs", "Request timeout (s)"),
    ("logging.level", "trace|debug|info|warn|error"),
];

impl ConfigCommand {
    /// Execute the config command
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        match self {
            ConfigCommand::Show => self.execute_show(ctx),
            ConfigCommand::Path => self.execute_path(ctx),
            ConfigCommand::Set { key, value } => self.execute_set(ctx, key, value),
            ConfigCommand::Validate => self.execute_validate(ctx),
        }
    }

    fn execute_show(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config_path = ctx.config_path();
        let config = ctx.read_config()?;

        info!(config_path = %config_path.display(), "Showing configuration");

        if ctx.format.is_json() {
            let json = serde_json::to_value(&config)
                .context("Failed to serialize configuration to JSON")?;
            formatter.print_json(&json);
        } else {
            formatter.success(&format!("Configuration ({})", config_path.display()));
            formatter.info("");

            let yaml = serde_yaml::to_string(&config)
                .context("Failed to serialize configuration to YAML")?;
            for line in yaml.lines() {
                formatter.info(line);
            }
        }

        Ok(())
    }

    fn execute_path(&self, ctx: &CliContext) -> Result<()> {
        let config_path = ctx.config_path();
        if ctx.format.is_json() {
            ctx.formatter().print_json(&serde_json::json!({
                "config_path": config_path.display().to_string(),
                "exists": config_path.exists(),
            }));
        } else {
            println!("{}", config_path.display());
        }
        Ok(())
    }

    fn execute_set(&self, ctx: &CliContext, key: &str, value: &str) -> Result<()> {
        let formatter = ctx.formatter();
        let config_path = ctx.config_path();
        let mut config = Config::load_or_default(&config_path);

        info!(key = %key, value = %value, "Setting configuration value");

        if let Err(e) = apply_config_value(&mut config, key, value) {
            if ctx.format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "success": false,
                    "key": key,
                    "value": value,
                    "error": e.to_string(),
                }));
            } else {
                formatter.error(&format!("Failed to set '{}': {}", key, e));
                formatter.info("");
                formatter.info("Supported keys:");
                for (name, description) in SUPPORTED_KEYS {
                    formatter.info(&format!("  {:<36} - {}", name, description));
                }
            }
            return Ok(());
        }

        // Refuse to save a configuration the limiter would reject
        let errors: Vec<String> = config.validate().iter().map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            if ctx.format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "success": false,
                    "key": key,
                    "value": value,
                    "errors": errors,
                }));
            } else {
                formatter.error(&format!("Invalid value for '{}': {}", key, errors.join("; ")));
            }
            return Ok(());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }
        let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
        std::fs::write(&config_path, yaml).context("Failed to write configuration file")?;

        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": true,
                "key": key,
                "value": value,
                "config_path": config_path.display().to_string(),
            }));
        } else {
            formatter.success(&format!("Set {} = {}", key, value));
            formatter.info(&format!("Saved to {}", config_path.display()));
        }
        Ok(())
    }

    fn execute_validate(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config_path = ctx.config_path();

        if !config_path.exists() {
            if ctx.format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "valid": true,
                    "config_path": config_path.display().to_string(),
                    "errors": [],
                    "note": "Configuration file not found; defaults in use",
                }));
            } else {
                formatter.info(&format!(
                    "Configuration file not found at {}",
                    config_path.display()
                ));
                formatter.info("Using default configuration.");
            }
            return Ok(());
        }

        let config = match Config::load(&config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                if ctx.format.is_json() {
                    formatter.print_json(&serde_json::json!({
                        "valid": false,
                        "config_path": config_path.display().to_string(),
                        "errors": [format!("Failed to parse configuration: {}", e)],
                    }));
                } else {
                    formatter.error(&format!("Failed to parse configuration: {}", e));
                    formatter.info(&format!("File: {}", config_path.display()));
                }
                return Ok(());
            }
        };

        info!(config_path = %config_path.display(), "Validating configuration");
        let errors = config.validate();

        if ctx.format.is_json() {
            let error_strings: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            formatter.print_json(&serde_json::json!({
                "valid": errors.is_empty(),
                "config_path": config_path.display().to_string(),
                "errors": error_strings,
            }));
        } else if errors.is_empty() {
            formatter.success("Configuration is valid");
            formatter.info(&format!("File: {}", config_path.display()));
        } else {
            formatter.error(&format!(
                "Configuration has {} error{}:",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" }
            ));
            formatter.info(&format!("File: {}", config_path.display()));
            formatter.info("");
            for error in &errors {
                formatter.info(&format!("  {} - {}", error.field, error.message));
            }
        }

        Ok(())
    }
}

/// Apply a dot-notation key/value pair to a Config struct
fn apply_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        // --- rate_limiting ---
        "rate_limiting.requests_per_second" => {
            config.rate_limiting.requests_per_second = value
                .parse::<f64>()
                .context("Expected a number for rate_limiting.requests_per_second")?;
        }
        "rate_limiting.burst_size" => {
            config.rate_limiting.burst_size =
                value.parse::<u32>().context("Expected a positive integer")?;
        }
        "rate_limiting.max_retries" => {
            config.rate_limiting.max_retries =
                value.parse::<u32>().context("Expected a positive integer")?;
        }
        "rate_limiting.backoff_base_ms" => {
            config.rate_limiting.backoff_base_ms =
                value.parse::<u64>().context("Expected a positive integer")?;
        }
        "rate_limiting.max_backoff_ms" => {
            config.rate_limiting.max_backoff_ms =
                value.parse::<u64>().context("Expected a positive integer")?;
        }

        // --- queues ---
        "queues.default_max_concurrent" => {
            config.queues.default_max_concurrent =
                value.parse::<usize>().context("Expected a positive integer")?;
        }
        _ if key.starts_with("queues.overrides.") => {
            let name = &key["queues.overrides.".len()..];
            if name.is_empty() {
                anyhow::bail!("Missing queue name in '{}'", key);
            }
            let cap = value.parse::<usize>().context("Expected a positive integer")?;
            config.queues.overrides.insert(name.to_string(), cap);
        }

        // --- http ---
        "http.user_agent" => {
            config.http.user_agent = value.to_string();
        }
        "http.timeout_secs" => {
            config.http.timeout_secs =
                value.parse::<u64>().context("Expected a positive integer")?;
        }

        // --- logging ---
        "logging.level" => {
            config.logging.level = value.to_string();
        }

        _ => {
            anyhow::bail!("Unknown configuration key: '{}'", key);
        }
    }

    Ok(())
}
