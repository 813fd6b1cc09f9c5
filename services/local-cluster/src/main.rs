//! minicluster local cluster
//!
//! Launches a coordinator and N workers inside this process, keeps them
//! running until Ctrl-C, then shuts them down in dependency order.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use minicluster_local::config::Config;
use minicluster_local::LocalCluster;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.default_filter().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        workers = config.workers,
        cpus = config.cpus,
        mem = config.mem,
        disk = config.disk,
        "Starting local cluster"
    );

    let mut cluster = LocalCluster::new();
    let coordinator = match cluster.launch(&config.to_configuration(), None).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "Failed to launch local cluster");
            std::process::exit(1);
        }
    };

    info!(
        coordinator = %coordinator.actor_id(),
        work_dirs = ?cluster.work_dirs(),
        "Local cluster ready, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    cluster.shutdown().await;
    info!("Local cluster shut down");

    Ok(())
}
