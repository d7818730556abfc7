//! Periodic copy of live peer counters into the registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use wga_reconcile::{is_fresh, CONNECTED_WINDOW};

use crate::engine::DeviceEngine;
use crate::error::EngineError;

/// Copies handshake time, traffic counters and endpoint from the peer table
/// onto device records.
///
/// A device is only written when this instance sees it connected now, or
/// the stored record says it was connected recently. Devices connected to a
/// different server instance keep their metadata.
pub struct MetadataCollector {
    engine: Arc<DeviceEngine>,
    interval: Duration,
}

impl MetadataCollector {
    pub fn new(engine: Arc<DeviceEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Run until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting metadata collection loop");

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.collect_at(Utc::now()).await {
                        error!(error = %e, "Metadata collection failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Metadata collection loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One collection pass as of `now`. Returns the number of devices written.
    pub async fn collect_at(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let registry = self.engine.registry();
        let peers = self.engine.peers().list_peers().await?;
        let mut updated = 0;

        for peer in peers {
            // Never handshaken with this instance.
            let Some(endpoint) = peer.endpoint else {
                continue;
            };

            let mut device = match registry.get_by_public_key(&peer.public_key).await {
                Ok(device) => device,
                Err(e) if e.is_not_found() => {
                    debug!(public_key = %peer.public_key, "Peer has no device");
                    continue;
                }
                Err(e) => {
                    warn!(public_key = %peer.public_key, error = %e, "Failed to look up device");
                    continue;
                }
            };

            let seen_here = is_fresh(peer.last_handshake_time, now, CONNECTED_WINDOW);
            if !seen_here && !device.connected_at(now) {
                continue;
            }

            device.last_handshake_time = peer.last_handshake_time;
            device.receive_bytes = peer.receive_bytes;
            device.transmit_bytes = peer.transmit_bytes;
            device.endpoint = Some(endpoint.to_string());

            match registry.update_metadata(&device).await {
                Ok(()) => updated += 1,
                // Deleted (or replaced) since the lookup above.
                Err(e) if e.is_not_found() => {
                    debug!(owner = %device.owner, name = %device.name, "Device gone before metadata update");
                }
                Err(e) => {
                    warn!(owner = %device.owner, name = %device.name, error = %e, "Failed to save device metadata");
                }
            }
        }

        debug!(updated, "Collected peer metadata");
        Ok(updated)
    }
}
