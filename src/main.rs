//! Portico: a multi-host HTTP/HTTPS server.
//!
//! This is the application entry point. It initializes tracing, then hands
//! control to the reload loop, which loads the YAML configuration, starts the
//! listeners and restarts them whenever the configuration file changes.

use std::time::Duration;

use clap::Parser;

use portico::config::DEFAULT_CONFIG_PATH;
use portico::http::interrupt;
use portico::logging::LogControl;
use portico::reload::ReloadController;

/// Portico: serve static sites, proxies and deploy hooks for many hosts
#[derive(Parser, Debug)]
#[command(name = "portico", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "portico=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Seconds to wait for connections to drain when stopping listeners
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let logging = LogControl::init(args.log_level)?;

    // Both ring and aws-lc-rs may be linked through dependencies; pin ours.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("Crypto provider already installed");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config,
        "Starting portico"
    );

    ReloadController::new(&args.config, Duration::from_secs(args.shutdown_timeout))
        .with_logging(logging)
        .run(interrupt())
        .await?;

    Ok(())
}
