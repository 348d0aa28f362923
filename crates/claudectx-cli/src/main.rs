//! claudectx CLI - Command-line front end for the request throttling layer
//!
//! Provides commands for:
//! - Exercising the token bucket rate limiter
//! - Demonstrating priority scheduling in the request queue
//! - Fetching URLs through the queue and a rate-limited HTTP session
//! - Managing configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use claudectx_core::config::Config;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{
    completions::CompletionsCommand, config::ConfigCommand, fetch::FetchCommand,
    queue::QueueCommand, throttle::ThrottleCommand, CliContext,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(
    name = "claudectx",
    version,
    about = "Rate-limited, prioritized request scheduling for context APIs"
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Acquire tokens from the rate limiter and show their pacing
    Throttle(ThrottleCommand),
    /// Run the priority queue demonstration
    Queue(QueueCommand),
    /// Fetch URLs through the request queue and rate limiter
    Fetch(FetchCommand),
    /// View and manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Generate shell completions
    Completions(CompletionsCommand),
}

/// Level used when neither `RUST_LOG` nor `-v` is given.
fn default_level(cli: &Cli) -> String {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    Config::load_or_default(&path).logging.level
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => default_level(&cli),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ctx = CliContext {
        format: if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        },
        quiet: cli.quiet,
        explicit_config: cli.config,
    };

    match cli.command {
        Commands::Throttle(cmd) => cmd.execute(&ctx).await,
        Commands::Queue(cmd) => cmd.execute(&ctx).await,
        Commands::Fetch(cmd) => cmd.execute(&ctx).await,
        Commands::Config(cmd) => cmd.execute(&ctx).await,
        Commands::Completions(cmd) => cmd.execute().await,
    }
}
