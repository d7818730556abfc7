//! On-disk registry backend.
//!
//! Layout: `<dir>/<owner>/<name>.json`, one document per device. Writes go
//! to a temp file first and are renamed into place, so readers never see a
//! partially written device.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::{DeviceRegistry, EventHub, RegistryError, RegistryEvent};
use crate::device::Device;

const DEVICE_EXTENSION: &str = "json";

/// Registry storing each device as a JSON file.
pub struct FileRegistry {
    dir: PathBuf,
    events: EventHub,

    /// Serialises writers so insert detection and rename are not interleaved.
    write_lock: Mutex<()>,
}

impl FileRegistry {
    /// Open (and create if needed) a storage directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        Ok(Self {
            dir,
            events: EventHub::new(),
            write_lock: Mutex::new(()),
        })
    }

    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.dir.join(escape_component(owner))
    }

    fn device_path(&self, owner: &str, name: &str) -> PathBuf {
        self.owner_dir(owner)
            .join(format!("{}.{DEVICE_EXTENSION}", escape_component(name)))
    }

    async fn read_device(path: &Path) -> Result<Device, RegistryError> {
        let raw = fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Append every readable device in `owner_dir` to `out`.
    async fn read_owner_dir(owner_dir: &Path, out: &mut Vec<Device>) -> Result<(), RegistryError> {
        let mut entries = match fs::read_dir(owner_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DEVICE_EXTENSION) {
                continue;
            }
            match Self::read_device(&path).await {
                Ok(device) => out.push(device),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable device file");
                }
            }
        }

        Ok(())
    }
}

/// Make a string safe to use as a single path component.
///
/// Anything outside `[A-Za-z0-9_@-]` (and a leading `.`) is percent-encoded,
/// so owners like `../x` cannot escape the storage directory.
fn escape_component(s: &str) -> String {
    if s.is_empty() {
        return "%".to_string();
    }

    let mut out = String::with_capacity(s.len());
    for (i, b) in s.bytes().enumerate() {
        let safe = b.is_ascii_alphanumeric()
            || matches!(b, b'-' | b'_' | b'@')
            || (b == b'.' && i > 0);
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[async_trait]
impl DeviceRegistry for FileRegistry {
    async fn save(&self, device: &Device) -> Result<(), RegistryError> {
        let path = self.device_path(&device.owner, &device.name);
        let bytes = serde_json::to_vec_pretty(device)?;

        let _guard = self.write_lock.lock().await;

        let inserted = !fs::try_exists(&path).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), inserted, "Saved device");
        if inserted {
            self.events.emit_add(device);
        }
        Ok(())
    }

    async fn update_metadata(&self, device: &Device) -> Result<(), RegistryError> {
        let path = self.device_path(&device.owner, &device.name);
        let not_found = || RegistryError::NotFound(format!("{}/{}", device.owner, device.name));

        let _guard = self.write_lock.lock().await;

        let mut stored = match Self::read_device(&path).await {
            Ok(stored) => stored,
            Err(RegistryError::Io(e)) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e),
        };
        if stored.public_key != device.public_key {
            return Err(not_found());
        }

        stored.last_handshake_time = device.last_handshake_time;
        stored.receive_bytes = device.receive_bytes;
        stored.transmit_bytes = device.transmit_bytes;
        stored.endpoint = device.endpoint.clone();

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&stored)?).await?;
        fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "Updated device metadata");
        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, RegistryError> {
        let mut devices = Vec::new();

        if let Some(owner) = owner {
            Self::read_owner_dir(&self.owner_dir(owner), &mut devices).await?;
            return Ok(devices);
        }

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                Self::read_owner_dir(&entry.path(), &mut devices).await?;
            }
        }

        Ok(devices)
    }

    async fn get(&self, owner: &str, name: &str) -> Result<Device, RegistryError> {
        match Self::read_device(&self.device_path(owner, name)).await {
            Err(RegistryError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(RegistryError::NotFound(format!("{owner}/{name}")))
            }
            other => other,
        }
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, RegistryError> {
        self.list(None)
            .await?
            .into_iter()
            .find(|d| d.public_key == public_key)
            .ok_or_else(|| RegistryError::NotFound(format!("public key {public_key}")))
    }

    async fn delete(&self, device: &Device) -> Result<(), RegistryError> {
        let path = self.device_path(&device.owner, &device.name);

        let _guard = self.write_lock.lock().await;

        let stored = match Self::read_device(&path).await {
            Ok(stored) => stored,
            Err(RegistryError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ok(()),
            // Corrupt record: still remove it, report what the caller handed us.
            Err(_) => device.clone(),
        };

        fs::remove_file(&path).await?;

        // Drop the owner directory once it is empty; a non-empty dir just stays.
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir(parent).await;
        }

        debug!(path = %path.display(), "Deleted device");
        self.events.emit_delete(&stored);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> Result<(), RegistryError> {
        let meta = fs::metadata(&self.dir).await?;
        if !meta.is_dir() {
            return Err(RegistryError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        Ok(())
    }
}
