//! Device registry backends.
//!
//! The registry is the single source of truth for which devices exist.
//! Backends:
//! - `memory`: in-process map, lost on restart
//! - `file`: one JSON document per device on local disk
//! - `sqlite`: single-file SQL database, change events published in process
//! - `postgres`: SQL table with LISTEN/NOTIFY change events
//!
//! Every backend publishes [`RegistryEvent`]s on a broadcast channel so the
//! engine can keep the tunnel peer table in step with the registry.

mod file;
mod memory;
mod postgres;
mod sqlite;
mod watcher;

pub use file::FileRegistry;
pub use memory::MemoryRegistry;
pub use postgres::PostgresRegistry;
pub use sqlite::SqliteRegistry;
pub use watcher::{EventHub, EVENT_CHANNEL_CAPACITY};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::device::Device;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No device matched the lookup.
    #[error("device not found: {0}")]
    NotFound(String),

    /// The backend is not reachable.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// Local storage I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be (de)serialised.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A database query failed.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run schema migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// None of the candidate migration directories could be loaded.
    #[error("migrations directory not found (tried: {tried}); last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// The storage URI could not be understood.
    #[error("invalid storage URI: {0}")]
    InvalidUri(String),
}

impl RegistryError {
    /// Returns true if this error means the record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Connection-level failures mean the database is unreachable; everything
/// else is a query error.
fn db_error(e: sqlx::Error) -> RegistryError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            RegistryError::Unavailable(e.to_string())
        }
        e => RegistryError::Query(e),
    }
}

/// A change observed in the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device was inserted.
    Added(Device),

    /// A device was removed.
    Deleted(Device),

    /// The backend lost and regained its connection; events may have been missed.
    Reconnected,
}

impl RegistryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Deleted(_) => "deleted",
            Self::Reconnected => "reconnected",
        }
    }
}

/// Capability interface over a device registry backend.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Insert or update a device keyed by `(owner, name)`.
    async fn save(&self, device: &Device) -> Result<(), RegistryError>;

    /// Overwrite the connection metadata (handshake time, traffic counters,
    /// endpoint) of an existing device.
    ///
    /// Never inserts. Returns [`RegistryError::NotFound`] unless a device
    /// with the same owner, name and public key is stored.
    async fn update_metadata(&self, device: &Device) -> Result<(), RegistryError>;

    /// List devices, optionally only those belonging to `owner`.
    async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, RegistryError>;

    /// Fetch a single device.
    async fn get(&self, owner: &str, name: &str) -> Result<Device, RegistryError>;

    /// Fetch a device by its public key.
    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, RegistryError>;

    /// Delete a device.
    async fn delete(&self, device: &Device) -> Result<(), RegistryError>;

    /// Subscribe to change notifications.
    ///
    /// Events published before the call are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), RegistryError>;
}

/// Open a registry backend from a storage URI.
///
/// Supported schemes: `memory://`, `file:///path/to/dir`,
/// `sqlite3:///path/to/db` (or `sqlite://`), `postgres://...` /
/// `postgresql://...`.
pub async fn open_registry(uri: &str) -> Result<Arc<dyn DeviceRegistry>, RegistryError> {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Err(RegistryError::InvalidUri(format!("missing scheme in '{uri}'")));
    };

    match scheme {
        "memory" => {
            warn!("Storing data in memory - devices will not persist between restarts");
            Ok(Arc::new(MemoryRegistry::new()))
        }
        "file" => {
            if rest.is_empty() {
                return Err(RegistryError::InvalidUri(
                    "file storage requires a directory path".to_string(),
                ));
            }
            let dir = PathBuf::from(rest);
            info!(path = %dir.display(), "Storing data on disk");
            Ok(Arc::new(FileRegistry::open(dir).await?))
        }
        "sqlite" | "sqlite3" => {
            if rest.is_empty() {
                return Err(RegistryError::InvalidUri(
                    "sqlite storage requires a database path".to_string(),
                ));
            }
            info!(path = %rest, "Storing data in sqlite");
            Ok(Arc::new(SqliteRegistry::connect(rest).await?))
        }
        "postgres" | "postgresql" => {
            info!("Storing data in postgres");
            Ok(Arc::new(PostgresRegistry::connect(uri).await?))
        }
        other => Err(RegistryError::InvalidUri(format!(
            "unknown storage backend '{other}'"
        ))),
    }
}
