//! Deletion of devices that have been idle past a grace period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use wga_reconcile::elapsed_since;

use crate::engine::DeviceEngine;
use crate::error::{EngineError, ErrorKind};

/// Deletes devices whose last handshake (or creation, if they never
/// connected) is older than the grace period.
pub struct InactivityPruner {
    engine: Arc<DeviceEngine>,
    grace: Duration,
    interval: Duration,
}

impl InactivityPruner {
    pub fn new(engine: Arc<DeviceEngine>, grace: Duration, interval: Duration) -> Self {
        Self {
            engine,
            grace,
            interval,
        }
    }

    /// Run until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            grace_secs = self.grace.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting inactive device deletion loop"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.prune_at(Utc::now()).await {
                        error!(error = %e, "Inactive device deletion failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Inactive device deletion loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pruning pass as of `now`. Returns the number of devices deleted.
    pub async fn prune_at(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let devices = self.engine.list_all_devices().await?;
        let mut deleted = 0;

        for device in devices {
            let since = device.last_handshake_time.unwrap_or(device.created_at);
            let idle = elapsed_since(since, now);
            if idle <= self.grace {
                continue;
            }

            info!(
                owner = %device.owner,
                name = %device.name,
                idle_secs = idle.as_secs(),
                "Deleting inactive device"
            );
            match self.engine.delete_device(&device.owner, &device.name).await {
                Ok(()) => deleted += 1,
                // Already gone, e.g. deleted by another instance.
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(owner = %device.owner, name = %device.name, "Device already deleted");
                }
                Err(e) => {
                    warn!(owner = %device.owner, name = %device.name, error = %e, "Failed to delete inactive device");
                }
            }
        }

        Ok(deleted)
    }
}
