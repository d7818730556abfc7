//! WireGuard access server.
//!
//! Keeps the tunnel endpoint's peer table in step with the device registry
//! and runs the background metadata and inactivity loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wga_access_server::{
    config,
    peers::{MemoryPeerTable, PeerTable, UapiPeerTable},
    registry::open_registry,
    DeviceEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to WGA_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting WireGuard access server");
    info!(
        storage = %config.storage.split("://").next().unwrap_or_default(),
        vpn_cidr = ?config.vpn_cidr,
        vpn_cidr_v6 = ?config.vpn_cidr_v6,
        "Configuration loaded"
    );

    let pools = config.address_pools()?;

    let registry = match open_registry(&config.storage).await {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "Failed to open device registry");
            return Err(e.into());
        }
    };

    let peers: Arc<dyn PeerTable> = match &config.wireguard_socket {
        Some(socket) => {
            info!(socket = %socket.display(), "Using userspace WireGuard control socket");
            Arc::new(UapiPeerTable::new(socket))
        }
        None => {
            warn!("No WireGuard socket configured - using an in-memory peer table");
            Arc::new(MemoryPeerTable::new())
        }
    };

    let engine = Arc::new(DeviceEngine::new(registry, peers.clone(), pools));

    let public_key = peers
        .public_key()
        .await
        .context("failed to read the tunnel endpoint public key")?;
    let server_addresses = engine
        .server_addresses()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    info!(public_key = %public_key, addresses = %server_addresses, "Tunnel endpoint ready");

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync = engine
        .start_sync(config.sync_options(), shutdown_rx)
        .await
        .context("failed to start peer synchronisation")?;
    info!(tasks = ?sync.task_names(), "Peer synchronisation started");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if tokio::time::timeout(Duration::from_secs(5), sync.join())
        .await
        .is_err()
    {
        warn!("Workers did not shut down in time");
    }

    info!("Access server shutdown complete");
    Ok(())
}
