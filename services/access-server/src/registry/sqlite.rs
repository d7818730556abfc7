//! SQLite registry backend.
//!
//! Same `devices` table as the Postgres backend, in a single database file.
//! SQLite has no cross-connection notifications, so change events are
//! published in process, like the file backend.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument};

use super::{db_error, DeviceRegistry, EventHub, RegistryError, RegistryEvent};
use crate::device::Device;

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DEVICE_COLUMNS: &str = "owner, owner_name, owner_email, owner_provider, name, public_key, \
     preshared_key, address, created_at, last_handshake_time, receive_bytes, transmit_bytes, endpoint";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    owner               TEXT    NOT NULL,
    owner_name          TEXT    NOT NULL DEFAULT '',
    owner_email         TEXT    NOT NULL DEFAULT '',
    owner_provider      TEXT    NOT NULL DEFAULT '',
    name                TEXT    NOT NULL,
    public_key          TEXT    NOT NULL,
    preshared_key       TEXT,
    address             TEXT    NOT NULL,
    created_at          TEXT    NOT NULL,
    last_handshake_time TEXT,
    receive_bytes       INTEGER NOT NULL DEFAULT 0,
    transmit_bytes      INTEGER NOT NULL DEFAULT 0,
    endpoint            TEXT,
    PRIMARY KEY (owner, name)
)
"#;

const CREATE_KEY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS devices_public_key_idx ON devices (public_key)";

/// Registry backed by a SQLite database file.
pub struct SqliteRegistry {
    pool: SqlitePool,
    events: EventHub,

    /// Serialises writers so events are published in commit order.
    write_lock: Mutex<()>,
}

impl SqliteRegistry {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    ///
    /// `:memory:` gives a private in-memory database.
    #[instrument(skip_all)]
    pub async fn connect(path: &str) -> Result<Self, RegistryError> {
        let in_memory = path == ":memory:";

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| RegistryError::InvalidUri(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };
        let options = options.busy_timeout(BUSY_TIMEOUT);

        // Every connection to `:memory:` is its own database; keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(MAX_CONNECTIONS)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        for statement in [CREATE_TABLE, CREATE_KEY_INDEX] {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(db_error)?;
        }
        debug!("Database schema ready");

        Ok(Self {
            pool,
            events: EventHub::new(),
            write_lock: Mutex::new(()),
        })
    }

    async fn fetch(&self, owner: &str, name: &str) -> Result<Option<Device>, RegistryError> {
        let row: Option<DeviceRow> = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE owner = ? AND name = ?"
        ))
        .bind(owner)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|DeviceRow(d)| d))
    }
}

struct DeviceRow(Device);

impl<'r> sqlx::FromRow<'r, SqliteRow> for DeviceRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
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
impl DeviceRegistry for SqliteRegistry {
    #[instrument(skip(self, device), fields(owner = %device.owner, name = %device.name))]
    async fn save(&self, device: &Device) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;

        let inserted = self.fetch(&device.owner, &device.name).await?.is_none();

        sqlx::query(
            r#"
            INSERT INTO devices (
                owner, owner_name, owner_email, owner_provider, name, public_key,
                preshared_key, address, created_at, last_handshake_time,
                receive_bytes, transmit_bytes, endpoint
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (owner, name) DO UPDATE SET
                owner_name = excluded.owner_name,
                owner_email = excluded.owner_email,
                owner_provider = excluded.owner_provider,
                public_key = excluded.public_key,
                preshared_key = excluded.preshared_key,
                address = excluded.address,
                last_handshake_time = excluded.last_handshake_time,
                receive_bytes = excluded.receive_bytes,
                transmit_bytes = excluded.transmit_bytes,
                endpoint = excluded.endpoint
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

        debug!(inserted, "Saved device");
        if inserted {
            self.events.emit_add(device);
        }
        Ok(())
    }

    async fn update_metadata(&self, device: &Device) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE devices SET
                last_handshake_time = ?,
                receive_bytes = ?,
                transmit_bytes = ?,
                endpoint = ?
            WHERE owner = ? AND name = ? AND public_key = ?
            "#,
        )
        .bind(device.last_handshake_time)
        .bind(device.receive_bytes)
        .bind(device.transmit_bytes)
        .bind(&device.endpoint)
        .bind(&device.owner)
        .bind(&device.name)
        .bind(&device.public_key)
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
                    "SELECT {DEVICE_COLUMNS} FROM devices WHERE owner = ? ORDER BY name"
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
        self.fetch(owner, name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("{owner}/{name}")))
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, RegistryError> {
        let row: Option<DeviceRow> = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE public_key = ? LIMIT 1"
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
        let _guard = self.write_lock.lock().await;

        let Some(stored) = self.fetch(&device.owner, &device.name).await? else {
            return Ok(());
        };

        sqlx::query("DELETE FROM devices WHERE owner = ? AND name = ?")
            .bind(&device.owner)
            .bind(&device.name)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        debug!("Deleted device");
        self.events.emit_delete(&stored);
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
