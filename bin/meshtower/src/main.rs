//! Meshtower daemon
//!
//! Serves every configured zone on the pub/sub bus and exposes the REST API
//! until SIGINT or SIGTERM.

mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use meshtower_api::ApiServer;
use meshtower_coordinator::{connect, Coordinator};
use meshtower_observability::init_logging;

use crate::cli::Cli;
use crate::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(&cli)?;

    // Hold the guard so file logs flush on exit
    let _guard = init_logging(&config.logging).context("Failed to initialize logging")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?
        .block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!(
        zones = config.coordinator.zones.len(),
        default_zone = %config.coordinator.default_zone,
        persist = config.coordinator.persist,
        "Starting meshtower"
    );

    let bus = connect(&config.coordinator.transport)
        .await
        .context("Failed to connect to the pub/sub bus")?;
    let coordinator = Coordinator::start(config.coordinator, bus)
        .await
        .context("Failed to start coordinator")?;

    let server = ApiServer::new(config.api, coordinator.clone());
    let served = server.run_with_shutdown(shutdown_signal()).await;

    coordinator.shutdown().await;
    served?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
