//! In-memory registry backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{DeviceRegistry, EventHub, RegistryError, RegistryEvent};
use crate::device::Device;

/// Registry backed by a map owned by this instance.
///
/// Devices do not survive a restart. Intended for development and tests.
pub struct MemoryRegistry {
    /// Devices keyed by (owner, name).
    devices: RwLock<BTreeMap<(String, String), Device>>,

    events: EventHub,

    /// When set, every operation fails as if the backend were down.
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            events: EventHub::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate the backend going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Publish a reconnect notification to subscribers.
    pub fn notify_reconnect(&self) {
        self.events.emit_reconnect();
    }

    /// Number of stored devices.
    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Returns true if no devices are stored.
    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable(
                "memory registry marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn key(owner: &str, name: &str) -> (String, String) {
    (owner.to_string(), name.to_string())
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn save(&self, device: &Device) -> Result<(), RegistryError> {
        self.check_available()?;

        // Publish under the write guard so events follow the order of writes.
        let mut devices = self.devices.write().await;
        let inserted = devices
            .insert(key(&device.owner, &device.name), device.clone())
            .is_none();

        debug!(owner = %device.owner, name = %device.name, inserted, "Saved device");
        if inserted {
            self.events.emit_add(device);
        }
        Ok(())
    }

    async fn update_metadata(&self, device: &Device) -> Result<(), RegistryError> {
        self.check_available()?;

        let mut devices = self.devices.write().await;
        let stored = devices
            .get_mut(&key(&device.owner, &device.name))
            .filter(|d| d.public_key == device.public_key)
            .ok_or_else(|| RegistryError::NotFound(format!("{}/{}", device.owner, device.name)))?;

        stored.last_handshake_time = device.last_handshake_time;
        stored.receive_bytes = device.receive_bytes;
        stored.transmit_bytes = device.transmit_bytes;
        stored.endpoint = device.endpoint.clone();
        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, RegistryError> {
        self.check_available()?;

        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .filter(|d| owner.map_or(true, |o| d.owner == o))
            .cloned()
            .collect())
    }

    async fn get(&self, owner: &str, name: &str) -> Result<Device, RegistryError> {
        self.check_available()?;

        self.devices
            .read()
            .await
            .get(&key(owner, name))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("{owner}/{name}")))
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, RegistryError> {
        self.check_available()?;

        self.devices
            .read()
            .await
            .values()
            .find(|d| d.public_key == public_key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("public key {public_key}")))
    }

    async fn delete(&self, device: &Device) -> Result<(), RegistryError> {
        self.check_available()?;

        let mut devices = self.devices.write().await;
        if let Some(removed) = devices.remove(&key(&device.owner, &device.name)) {
            debug!(owner = %removed.owner, name = %removed.name, "Deleted device");
            self.events.emit_delete(&removed);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> Result<(), RegistryError> {
        self.check_available()
    }
}
