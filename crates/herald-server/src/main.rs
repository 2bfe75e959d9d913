//! # Herald Server
//!
//! Push notification server: subscribers hold WebSocket connections keyed
//! by subscriber key, publishers push private messages over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Run with environment variables
//! HERALD_PORT=8080 HERALD_HOST=0.0.0.0 herald
//! ```
//!
//! A `herald.toml` in the working directory, `/etc/herald/` or
//! `~/.config/herald/` overrides the defaults.

mod config;
mod handlers;
mod metrics;
mod subscriber;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=info,herald_core=info,herald_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Herald server on {}:{} (subscribers on port {})",
        config.host,
        config.port,
        config.subscriber.port
    );

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
