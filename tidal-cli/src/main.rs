//! Tidal CLI - diagnostics for engine support, peer admission and the service link

use std::path::PathBuf;

use clap::Parser;
use tidal_core::TidalConfig;
use tidal_core::tracing_setup::{CliLogLevel, init_tracing};

mod commands;

#[derive(Parser)]
#[command(name = "tidal")]
#[command(about = "Inspect Tidal download engines, peer filters and the service connection")]
struct Cli {
    /// Console log level (the full trace always goes to logs/)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// JSON configuration file; defaults plus TIDAL_* environment otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), None).map_err(|e| anyhow::anyhow!(e))?;

    let config = match &cli.config {
        Some(path) => TidalConfig::from_json_file(path)?,
        None => TidalConfig::from_env()?,
    };

    commands::handle_command(cli.command, config).await
}
