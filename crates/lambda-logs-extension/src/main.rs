//! Lambda logs extension binary.
//!
//! Registers as an external extension, subscribes to the Logs API and
//! forwards every log record as a structured event.
//!
//! # Configuration
//!
//! Configuration is loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `/opt/lambda-logs-extension.toml` (or `--config`)
//! 3. `LIBHONEY_*`, `HONEYCOMB_*` and `LOGS_API_*` environment variables
//! 4. Environment variables with `LAMBDA_LOGS_EXT_` prefix
//!
//! Run with `--local-mode` to start only the log receiver, outside Lambda.

use anyhow::Context;
use clap::Parser;
use lambda_logs_extension::config::{DEBUG_ENV, DEFAULT_CONFIG_PATH, env_bool};
use lambda_logs_extension::{Config, ExtensionRuntime, Result, init_tracing};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "lambda-logs-extension", version, about)]
struct Cli {
    /// Only run the log receiver; skip registration and subscription.
    #[arg(long)]
    local_mode: bool,

    /// Path to the TOML config file.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::load_from_path(&self.config)?;
        if self.local_mode {
            config.local_mode = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(env_bool(DEBUG_ENV).unwrap_or(false))
        .context("failed to initialise tracing subscriber")?;

    let config = cli.load_config().context("failed to load configuration")?;
    tracing::debug!(
        local_mode = config.local_mode,
        publishing = config.publisher.is_enabled(),
        "Configuration loaded"
    );

    ExtensionRuntime::new(config)
        .run()
        .await
        .context("extension runtime failed")?;

    Ok(())
}
