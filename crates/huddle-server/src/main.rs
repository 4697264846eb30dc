//! # Huddle Server
//!
//! Chat rooms on one node, or presence-checked chat across a cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Rooms over the line protocol (telnet/nc friendly)
//! huddle local
//!
//! # Shared presence store and bus, then a cluster node in front of it
//! huddle hub
//! huddle cluster
//!
//! # Chat through a cluster node
//! huddle client --server ws://127.0.0.1:3000/rpc
//!
//! # Run with custom config or environment variables
//! huddle --config /path/to/huddle.toml local
//! HUDDLE_PORT=9000 HUDDLE_HOST=0.0.0.0 huddle local
//! ```

mod cli;
mod client;
mod config;
mod hub;
mod local;
mod metrics;
mod remote;
mod rpc;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Mode};
use huddle_core::ShutdownCoordinator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let interactive = matches!(cli.command, Mode::Client { .. });

    // Initialize tracing; the client keeps stdout for chat
    let default_filter = if interactive { "huddle=warn" } else { "huddle=debug" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    if interactive {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Load configuration
    let config = config::Config::load(cli.config.as_deref())?;

    let shutdown = ShutdownCoordinator::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                return;
            }
            tracing::info!("Interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    if !interactive && config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::warn!(error = %e, "Metrics exporter not started");
        }
    }

    match cli.command {
        Mode::Local => {
            tracing::info!("Starting Huddle local server on {}:{}", config.host, config.port);
            local::run(config, shutdown).await
        }
        Mode::Cluster => {
            tracing::info!(
                "Starting Huddle cluster node on {}:{}",
                config.host,
                config.cluster.port
            );
            rpc::run(config, shutdown).await
        }
        Mode::Hub => {
            tracing::info!("Starting Huddle hub on {}:{}", config.host, config.hub.port);
            hub::run(config, shutdown).await
        }
        Mode::Client { server, user } => {
            let url = server.unwrap_or_else(|| config.rpc_url());
            client::run(&url, user, config.limits.max_frame_size, shutdown.token()).await
        }
    }
}
