//! netpaste - two-way clipboard synchronization client
//!
//! This is the main entry point for the netpaste binary.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netpaste::cli::{Cli, CliHandler};
use netpaste::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_config(cli.config.clone()).context("Failed to load configuration")?;

    // Initialize logging; stdout is reserved for operator feedback
    let log_level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("netpaste={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("netpaste v{}", netpaste::VERSION);

    CliHandler::new(cli, config).run().await?;

    Ok(())
}
