//! xarb - Entry Point
//!
//! Connects the configured venue streams and REST client, then runs until
//! ctrl-c or a fatal stream error.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Exchange connectivity runner
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via XARB_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // TLS crypto provider must be installed before any WS connection
    xarb_ws::init_crypto();

    let args = Args::parse();

    xarb_telemetry::init_logging()?;

    info!("Starting xarb v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > XARB_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("XARB_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = xarb_bot::AppConfig::load(&config_path)?;
    info!(streams = config.streams.len(), rest_base_url = %config.rest.base_url, "Configuration loaded");

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let app = xarb_bot::Application::new(config)?;
    app.run().await?;

    Ok(())
}
