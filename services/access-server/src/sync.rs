//! Background synchronisation: registry event dispatch and the periodic
//! metadata and inactivity loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use wga_reconcile::{DEFAULT_METADATA_INTERVAL, DEFAULT_PRUNE_INTERVAL};

use crate::engine::DeviceEngine;
use crate::error::EngineError;
use crate::inactive::InactivityPruner;
use crate::metadata::MetadataCollector;
use crate::registry::RegistryEvent;

/// Default inactivity grace period (90 days).
pub const DEFAULT_INACTIVE_GRACE: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Which background loops [`DeviceEngine::start_sync`] launches, and how.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub disable_metadata: bool,
    pub disable_inactivity_pruning: bool,

    /// Devices idle for longer than this are deleted.
    pub inactive_grace: Duration,

    pub metadata_interval: Duration,
    pub prune_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            disable_metadata: false,
            disable_inactivity_pruning: true,
            inactive_grace: DEFAULT_INACTIVE_GRACE,
            metadata_interval: DEFAULT_METADATA_INTERVAL,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }
}

/// Tasks spawned by [`DeviceEngine::start_sync`].
pub struct SyncHandle {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl SyncHandle {
    /// Names of the running tasks.
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Wait for every task to finish. Tasks stop once the shutdown channel
    /// passed to `start_sync` flips to `true`.
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Sync task ended abnormally");
            }
        }
    }

    /// Stop every task without waiting.
    pub fn abort(&self) {
        for (_, task) in &self.tasks {
            task.abort();
        }
    }
}

impl DeviceEngine {
    /// Start keeping the peer table in sync with the registry.
    ///
    /// Subscribes to registry events before the first full reconcile so no
    /// change slips between the two, then launches the event dispatcher and
    /// whichever periodic loops `options` enables.
    pub async fn start_sync(
        self: &Arc<Self>,
        options: SyncOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SyncHandle, EngineError> {
        let events = self.registry().subscribe();

        self.full_reconcile().await?;

        let mut tasks = Vec::with_capacity(3);
        tasks.push((
            "dispatcher",
            tokio::spawn(dispatch(self.clone(), events, shutdown.clone())),
        ));

        if options.disable_metadata {
            info!("Metadata collection disabled");
        } else {
            let collector = MetadataCollector::new(self.clone(), options.metadata_interval);
            let shutdown = shutdown.clone();
            tasks.push(("metadata", tokio::spawn(async move { collector.run(shutdown).await })));
        }

        if options.disable_inactivity_pruning {
            info!("Inactive device deletion disabled");
        } else {
            let pruner = InactivityPruner::new(
                self.clone(),
                options.inactive_grace,
                options.prune_interval,
            );
            let shutdown = shutdown.clone();
            tasks.push(("inactivity", tokio::spawn(async move { pruner.run(shutdown).await })));
        }

        Ok(SyncHandle { tasks })
    }
}

/// Apply registry events in arrival order until shutdown.
///
/// A lagged receiver has lost events, which is handled exactly like a
/// registry reconnect.
#[instrument(skip_all)]
async fn dispatch(
    engine: Arc<DeviceEngine>,
    mut events: broadcast::Receiver<RegistryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting registry event dispatcher");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => engine.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Registry events dropped, resyncing");
                    engine.handle_event(RegistryEvent::Reconnected).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Registry event stream closed");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Registry event dispatcher shutting down");
                    break;
                }
            }
        }
    }
}
