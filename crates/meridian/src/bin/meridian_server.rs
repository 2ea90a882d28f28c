//! # MERIDIAN Server
//!
//! Runs a single node until Ctrl-C.
//!
//! ```bash
//! # Defaults (in-memory world)
//! ./meridian_server
//!
//! # With a config file
//! RUST_LOG=meridian=debug ./meridian_server meridian.toml
//! ```

use meridian::core::{ConfigHandle, MeridianConfig};
use meridian::shard::DiscoveryRegistry;
use meridian::{Node, NodeResult};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}

async fn run() -> NodeResult<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "loading config");
            MeridianConfig::load(&path)?
        }
        None => MeridianConfig::default(),
    };
    let config = ConfigHandle::new(config);

    let registry = DiscoveryRegistry::new();
    let node = Node::start(config, &registry).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    node.stop().await;
    Ok(())
}
