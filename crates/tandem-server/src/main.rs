//! # Tandem Server
//!
//! Signaling relay and collaborative document hub.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tandem
//!
//! # Run with environment variables
//! TANDEM_PORT=8080 TANDEM_HOST=0.0.0.0 TANDEM_HEARTBEAT_MS=30000 tandem
//! ```
//!
//! Configuration is read from `tandem.toml`, `/etc/tandem/tandem.toml` or
//! `~/.config/tandem/tandem.toml`, whichever exists first.

mod config;
mod error;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=debug,tandem_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Tandem server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
