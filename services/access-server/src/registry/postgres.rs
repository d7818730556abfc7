//! Postgres registry backend.
//!
//! Devices live in a `devices` table keyed by `(owner, name)`. A trigger
//! publishes inserts and deletes on the `wga_devices` channel; a background
//! listener turns those notifications into [`RegistryEvent`]s. When the
//! listener connection drops it reconnects with backoff and publishes
//! [`RegistryEvent::Reconnected`], since notifications sent while it was
//! away are lost.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{db_error, DeviceRegistry, EventHub, RegistryError, RegistryEvent};
use crate::device::Device;

/// Notification channel the trigger publishes on.
pub const NOTIFY_CHANNEL: &str = "wga_devices";

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const DEVICE_COLUMNS: &str = "owner, owner_name, owner_email, owner_provider, name, public_key, \
     preshared_key, address, created_at, last_handshake_time, receive_bytes, transmit_bytes, endpoint";

/// Registry backed by a Postgres table.
pub struct PostgresRegistry {
    pool: PgPool,
    events: EventHub,
    listener: JoinHandle<()>,
}

impl PostgresRegistry {
    /// Connect, run migrations and start listening for change notifications.
    ///
    /// Returns once the listener is subscribed, so no change committed after
    /// this call is missed.
    pub async fn connect(url: &str) -> Result<Self, RegistryError> {
        info!("Connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        run_migrations(&pool).await?;

        let mut listener = PgListener::connect_with(&pool).await.map_err(db_error)?;
        listener.listen(NOTIFY_CHANNEL).await.map_err(db_error)?;
        info!(channel = NOTIFY_CHANNEL, "Listening for registry changes");

        let events = EventHub::new();
        let task = tokio::spawn(listen_loop(pool.clone(), listener, events.clone()));

        Ok(Self {
            pool,
            events,
            listener: task,
        })
    }
}

impl Drop for PostgresRegistry {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn run_migrations(pool: &PgPool) -> Result<(), RegistryError> {
    let candidates = vec![
        PathBuf::from("./migrations"),
        PathBuf::from("services/access-server/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ];
    let mut last_error: Option<sqlx::migrate::MigrateError> = None;

    for dir in &candidates {
        match sqlx::migrate::Migrator::new(dir.clone()).await {
            Ok(migrator) => {
                info!(migrations_dir = %dir.display(), "Loaded migrations");
                migrator.run(pool).await.map_err(RegistryError::Migration)?;
                info!("Database migrations complete");
                return Ok(());
            }
            Err(e) => last_error = Some(e),
        }
    }

    let tried = candidates
        .iter()
        .map(|dir| dir.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");

    Err(RegistryError::MigrationDirNotFound {
        tried,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string()),
    })
}

#[derive(Debug, Deserialize)]
struct Notification {
    action: String,
    data: Device,
}

/// Translate a trigger payload into an event. Unknown actions are ignored.
fn parse_notification(payload: &str) -> Result<Option<RegistryEvent>, serde_json::Error> {
    let notification: Notification = serde_json::from_str(payload)?;
    Ok(match notification.action.as_str() {
        "INSERT" => Some(RegistryEvent::Added(notification.data)),
        "DELETE" => Some(RegistryEvent::Deleted(notification.data)),
        _ => None,
    })
}

#[instrument(skip_all)]
async fn listen_loop(pool: PgPool, mut listener: PgListener, events: EventHub) {
    loop {
        // Drain until the connection drops.
        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => match parse_notification(notification.payload()) {
                    Ok(Some(RegistryEvent::Added(device))) => events.emit_add(&device),
                    Ok(Some(RegistryEvent::Deleted(device))) => events.emit_delete(&device),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Ignoring malformed registry notification"),
                },
                Ok(None) => {
                    warn!("Registry notification connection lost");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Registry notification stream failed");
                    break;
                }
            }
        }

        listener = reconnect(&pool).await;
        info!("Reconnected to registry notifications");
        events.emit_reconnect();
    }
}

async fn reconnect(pool: &PgPool) -> PgListener {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tokio::time::sleep(backoff).await;

        match PgListener::connect_with(pool).await {
            Ok(mut listener) => match listener.listen(NOTIFY_CHANNEL).await {
                Ok(()) => return listener,
                Err(e) => warn!(error = %e, "Failed to subscribe to registry notifications"),
            },
            Err(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Registry reconnect failed");
            }
        }

        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

struct DeviceRow(Device);

impl<'r> sqlx::FromRow<'r, PgRow> for DeviceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self(Device {
            owner: row.try_get("owner")?,
            owner_name: row.try_get("owner_name")?,
            owner_email: row.try_get("owner_email")?,
            owner_provider: row.try_get("owner_provider")?,
            name: row.try_get("name")?,
            public_key: row.try_get("public_key")?,
            preshared_key: row.try_get("preshared_key")?,
            address: row.try_get("address")?,
            created_at: row.try_get("created_at")?,
            last_handshake_time: row.try_get("last_handshake_time")?,
            receive_bytes: row.try_get("receive_bytes")?,
            transmit_bytes: row.try_get("transmit_bytes")?,
            endpoint: row.try_get("endpoint")?,
        }))
    }
}

#[async_trait]
impl DeviceRegistry for PostgresRegistry {
    #[instrument(skip(self, device), fields(owner = %device.owner, name = %device.name))]
    async fn save(&self, device: &Device) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO devices (
                owner, owner_name, owner_email, owner_provider, name, public_key,
                preshared_key, address, created_at, last_handshake_time,
                receive_bytes, transmit_bytes, endpoint
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (owner, name) DO UPDATE SET
                owner_name = EXCLUDED.owner_name,
                owner_email = EXCLUDED.owner_email,
                owner_provider = EXCLUDED.owner_provider,
                public_key = EXCLUDED.public_key,
                preshared_key = EXCLUDED.preshared_key,
                address = EXCLUDED.address,
                last_handshake_time = EXCLUDED.last_handshake_time,
                receive_bytes = EXCLUDED.receive_bytes,
                transmit_bytes = EXCLUDED.transmit_bytes,
                endpoint = EXCLUDED.endpoint
            "#,
        )
        .bind(&device.owner)
        .bind(&device.owner_name)
        .bind(&device.owner_email)
        .bind(&device.owner_provider)
        .bind(&device.name)
        .bind(&device.public_key)
        .bind(&device.preshared_key)
        .bind(&device.address)
        .bind(device.created_at)
        .bind(device.last_handshake_time)
        .bind(device.receive_bytes)
        .bind(device.transmit_bytes)
        .bind(&device.endpoint)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        debug!("Saved device");
        Ok(())
    }

    async fn update_metadata(&self, device: &Device) -> Result<(), RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET
                last_handshake_time = $4,
                receive_bytes = $5,
                transmit_bytes = $6,
                endpoint = $7
            WHERE owner = $1 AND name = $2 AND public_key = $3
            "#,
        )
        .bind(&device.owner)
        .bind(&device.name)
        .bind(&device.public_key)
        .bind(device.last_handshake_time)
        .bind(device.receive_bytes)
        .bind(device.transmit_bytes)
        .bind(&device.endpoint)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!(
                "{}/{}",
                device.owner, device.name
            )));
        }
        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, RegistryError> {
        let rows: Vec<DeviceRow> = match owner {
            Some(owner) => {
                sqlx::query_as::<_, DeviceRow>(&format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices WHERE owner = $1 ORDER BY name"
                ))
                .bind(owner)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, DeviceRow>(&format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY owner, name"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_error)?;

        Ok(rows.into_iter().map(|DeviceRow(d)| d).collect())
    }

    async fn get(&self, owner: &str, name: &str) -> Result<Device, RegistryError> {
        let row: Option<DeviceRow> = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE owner = $1 AND name = $2"
        ))
        .bind(owner)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|DeviceRow(d)| d)
            .ok_or_else(|| RegistryError::NotFound(format!("{owner}/{name}")))
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, RegistryError> {
        let row: Option<DeviceRow> = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE public_key = $1 LIMIT 1"
        ))
        .bind(public_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|DeviceRow(d)| d)
            .ok_or_else(|| RegistryError::NotFound(format!("public key {public_key}")))
    }

    #[instrument(skip(self, device), fields(owner = %device.owner, name = %device.name))]
    async fn delete(&self, device: &Device) -> Result<(), RegistryError> {
        let result = sqlx::query("DELETE FROM devices WHERE owner = $1 AND name = $2")
            .bind(&device.owner)
            .bind(&device.name)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        debug!(rows = result.rows_affected(), "Deleted device");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> Result<(), RegistryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}
