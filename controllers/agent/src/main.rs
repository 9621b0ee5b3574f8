//! podnet node agent
//!
//! Serves the IPAM RPC surface to the CNI plugin, keeps IPPool status
//! counters current and mirrors cluster pod placements into the dataplane.

mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod mirror;
mod reconciler;
mod server;
mod watcher;

use crate::config::AgentConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's TLS stack needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting podnet agent");

    let config = AgentConfig::from_env()?;

    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  RPC address: {}", config.listen_addr);
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  BPF map directory: {}", config.bpf_map_dir.display());

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
