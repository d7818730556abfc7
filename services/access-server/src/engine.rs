//! Device lifecycle and registry-to-peer-table reconciliation.
//!
//! [`DeviceEngine`] is the only writer of device records on create and
//! delete. The peer table is never written from the request path; it is
//! driven from registry events (see [`crate::sync`]) and from
//! [`DeviceEngine::full_reconcile`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use wga_networking::{validate_key, AddressPools, NetworkError};
use wga_reconcile::plan_convergence;

use crate::device::{Device, Identity, User};
use crate::error::EngineError;
use crate::peers::PeerTable;
use crate::registry::{DeviceRegistry, RegistryEvent};

/// Outcome of a [`DeviceEngine::full_reconcile`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Orphan peers removed.
    pub removed: usize,
    /// Devices added or updated in the peer table.
    pub upserted: usize,
    /// Devices whose peer already matched.
    pub unchanged: usize,
    /// Individual removals or upserts that failed.
    pub failed: usize,
}

/// Orchestrates devices across the registry and the tunnel peer table.
pub struct DeviceEngine {
    registry: Arc<dyn DeviceRegistry>,
    peers: Arc<dyn PeerTable>,
    pools: AddressPools,

    /// Held across list -> allocate -> save so concurrent creates cannot
    /// pick the same address.
    allocation_lock: Mutex<()>,
}

impl DeviceEngine {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        peers: Arc<dyn PeerTable>,
        pools: AddressPools,
    ) -> Self {
        Self {
            registry,
            peers,
            pools,
            allocation_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn peers(&self) -> &Arc<dyn PeerTable> {
        &self.peers
    }

    /// The tunnel endpoint's own address in each configured pool.
    pub fn server_addresses(&self) -> Vec<IpNet> {
        self.pools.server_addresses()
    }

    // ========================================================================
    // Device operations
    // ========================================================================

    /// Register a new device and allocate its address.
    ///
    /// Only the registry is written. The peer is added when the registry
    /// reports the insert.
    #[instrument(skip(self, identity, public_key, preshared_key), fields(owner = %identity.subject))]
    pub async fn create_device(
        &self,
        identity: &Identity,
        name: &str,
        public_key: &str,
        preshared_key: Option<&str>,
    ) -> Result<Device, EngineError> {
        if name.is_empty() {
            return Err(EngineError::EmptyName);
        }

        let _guard = self.allocation_lock.lock().await;

        let devices = self.registry.list(None).await?;
        if devices
            .iter()
            .any(|d| d.owner == identity.subject && d.name == name)
        {
            return Err(EngineError::DuplicateName {
                name: name.to_string(),
            });
        }

        validate_key(public_key).map_err(|source| EngineError::InvalidKey {
            field: "public key",
            source,
        })?;
        if let Some(psk) = preshared_key {
            validate_key(psk).map_err(|source| EngineError::InvalidKey {
                field: "preshared key",
                source,
            })?;
        }

        // The peer table is keyed by public key; two devices cannot share one.
        if devices.iter().any(|d| d.public_key == public_key) {
            return Err(EngineError::DuplicateKey);
        }

        let address = self
            .pools
            .allocate(devices.iter().map(|d| d.address.as_str()))
            .map_err(EngineError::Exhausted)?;

        let device = Device {
            owner: identity.subject.clone(),
            owner_name: identity.name.clone(),
            owner_email: identity.email.clone(),
            owner_provider: identity.provider.clone(),
            name: name.to_string(),
            public_key: public_key.to_string(),
            preshared_key: preshared_key.map(str::to_string),
            address: address.to_string(),
            created_at: Utc::now(),
            last_handshake_time: None,
            receive_bytes: 0,
            transmit_bytes: 0,
            endpoint: None,
        };

        self.registry.save(&device).await?;

        info!(name = %device.name, address = %device.address, "Created device");
        Ok(device)
    }

    /// Remove a device from the registry. The peer is removed when the
    /// registry reports the delete.
    pub async fn delete_device(&self, owner: &str, name: &str) -> Result<(), EngineError> {
        let device = self.registry.get(owner, name).await.map_err(|e| {
            if e.is_not_found() {
                EngineError::NotFound {
                    owner: owner.to_string(),
                    name: name.to_string(),
                }
            } else {
                EngineError::Registry(e)
            }
        })?;

        self.registry.delete(&device).await?;
        info!(owner = %owner, name = %name, "Deleted device");
        Ok(())
    }

    pub async fn list_devices(&self, owner: &str) -> Result<Vec<Device>, EngineError> {
        Ok(self.registry.list(Some(owner)).await?)
    }

    pub async fn list_all_devices(&self) -> Result<Vec<Device>, EngineError> {
        Ok(self.registry.list(None).await?)
    }

    /// Distinct device owners, sorted by owner id.
    ///
    /// The display name comes from the owner's most recently created device.
    pub async fn list_users(&self) -> Result<Vec<User>, EngineError> {
        let devices = self.registry.list(None).await?;

        let mut latest: BTreeMap<&str, &Device> = BTreeMap::new();
        for device in &devices {
            latest
                .entry(device.owner.as_str())
                .and_modify(|seen| {
                    if device.created_at >= seen.created_at {
                        *seen = device;
                    }
                })
                .or_insert(device);
        }

        Ok(latest
            .into_iter()
            .map(|(owner, device)| User {
                name: owner.to_string(),
                display_name: device.owner_name.clone(),
            })
            .collect())
    }

    /// Delete every device of `owner`.
    ///
    /// Not atomic: stops at the first failure, leaving earlier deletions in
    /// place. Calling again resumes with whatever is left.
    pub async fn delete_devices_for_user(&self, owner: &str) -> Result<(), EngineError> {
        let devices = self.registry.list(Some(owner)).await?;
        let total = devices.len();

        for (deleted, device) in devices.iter().enumerate() {
            if let Err(e) = self.registry.delete(device).await {
                warn!(
                    owner = %owner,
                    name = %device.name,
                    deleted,
                    total,
                    error = %e,
                    "Bulk device deletion stopped"
                );
                return Err(e.into());
            }
        }

        info!(owner = %owner, deleted = total, "Deleted all devices for user");
        Ok(())
    }

    /// Fail if either the registry or the tunnel endpoint is unreachable.
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.registry.ping().await?;
        self.peers.ping().await?;
        Ok(())
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Make the peer table match the registry.
    ///
    /// Orphan peers are removed first, then devices whose peer is missing or
    /// has different allowed addresses are upserted. Individual failures are
    /// logged and counted; only failing to read either side is an error.
    #[instrument(skip(self))]
    pub async fn full_reconcile(&self) -> Result<ReconcileStats, EngineError> {
        let devices = self.registry.list(None).await?;
        let peers = self.peers.list_peers().await?;

        let mut stats = ReconcileStats::default();
        let registered: BTreeSet<&str> = devices.iter().map(|d| d.public_key.as_str()).collect();

        let mut by_key: BTreeMap<String, &Device> = BTreeMap::new();
        let mut desired: BTreeMap<String, Vec<IpNet>> = BTreeMap::new();
        for device in &devices {
            match sorted_addresses(device) {
                Ok(addresses) => {
                    by_key.insert(device.public_key.clone(), device);
                    desired.insert(device.public_key.clone(), addresses);
                }
                Err(e) => {
                    warn!(owner = %device.owner, name = %device.name, error = %e, "Skipping device with bad address");
                    stats.failed += 1;
                }
            }
        }

        let current: BTreeMap<String, Vec<IpNet>> = peers
            .into_iter()
            .map(|mut p| {
                p.allowed_ips.sort();
                (p.public_key, p.allowed_ips)
            })
            .collect();

        let plan = plan_convergence(&desired, &current);
        stats.unchanged = plan.unchanged;
        if plan.is_converged() {
            debug!(peers = plan.unchanged, "Peer table already converged");
        }

        for public_key in &plan.remove {
            // Peers of registered devices we could not parse are not orphans.
            if registered.contains(public_key.as_str()) {
                continue;
            }
            match self.peers.remove_peer(public_key).await {
                Ok(()) => {
                    debug!(public_key = %public_key, "Removed orphan peer");
                    stats.removed += 1;
                }
                Err(e) => {
                    warn!(public_key = %public_key, error = %e, "Failed to remove orphan peer");
                    stats.failed += 1;
                }
            }
        }

        for public_key in &plan.upsert {
            let Some(device) = by_key.get(public_key) else {
                continue;
            };
            match self.apply_device(device).await {
                Ok(()) => stats.upserted += 1,
                Err(e) => {
                    warn!(owner = %device.owner, name = %device.name, error = %e, "Failed to sync device");
                    stats.failed += 1;
                }
            }
        }

        info!(
            removed = stats.removed,
            upserted = stats.upserted,
            unchanged = stats.unchanged,
            failed = stats.failed,
            "Reconciled peer table"
        );
        Ok(stats)
    }

    /// Apply a single registry event to the peer table.
    ///
    /// Errors are logged, never returned; a missed event is repaired by the
    /// next full reconcile.
    pub async fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added(device) => {
                if let Err(e) = self.apply_device(&device).await {
                    warn!(owner = %device.owner, name = %device.name, error = %e, "Failed to add peer");
                }
            }
            RegistryEvent::Deleted(device) => self.remove_device_peer(&device).await,
            RegistryEvent::Reconnected => {
                info!("Registry reconnected, resyncing peer table");
                if let Err(e) = self.full_reconcile().await {
                    warn!(error = %e, "Resync after reconnect failed");
                }
            }
        }
    }

    /// Remove the peer of a deleted device, unless another registered device
    /// still uses the same public key, in which case that device's peer is
    /// re-applied.
    async fn remove_device_peer(&self, device: &Device) {
        match self.registry.get_by_public_key(&device.public_key).await {
            Ok(holder) => {
                debug!(
                    owner = %device.owner,
                    name = %device.name,
                    holder = %holder.name,
                    "Public key still registered, keeping peer"
                );
                if let Err(e) = self.apply_device(&holder).await {
                    warn!(owner = %holder.owner, name = %holder.name, error = %e, "Failed to sync peer");
                }
                return;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(owner = %device.owner, name = %device.name, error = %e, "Key lookup failed, removing peer anyway");
            }
        }

        match self.peers.remove_peer(&device.public_key).await {
            Ok(()) => debug!(owner = %device.owner, name = %device.name, "Removed peer"),
            Err(e) => {
                warn!(owner = %device.owner, name = %device.name, error = %e, "Failed to remove peer");
            }
        }
    }

    /// Upsert a device's peer.
    pub(crate) async fn apply_device(&self, device: &Device) -> Result<(), EngineError> {
        let addresses = sorted_addresses(device)?;
        self.peers
            .add_peer(
                &device.public_key,
                device.preshared_key.as_deref(),
                &addresses,
            )
            .await?;
        debug!(owner = %device.owner, name = %device.name, "Synced peer");
        Ok(())
    }
}

fn sorted_addresses(device: &Device) -> Result<Vec<IpNet>, EngineError> {
    let mut addresses = device
        .addresses()
        .map_err(|source: NetworkError| EngineError::CorruptRecord {
            owner: device.owner.clone(),
            name: device.name.clone(),
            source,
        })?;
    addresses.sort();
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Peer;
    use crate::error::ErrorKind;
    use crate::peers::MemoryPeerTable;
    use crate::registry::MemoryRegistry;

    const KEY_A: &str = "YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4eXoxMjM0NTY=";
    const KEY_B: &str = "QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVoxMjM0NTY=";
    const KEY_C: &str = "MDEyMzQ1Njc4OWFiY2RlZmdoaWprbG1ub3BxcnN0dXY=";

    fn engine(v4: Option<&str>, v6: Option<&str>) -> (Arc<MemoryRegistry>, Arc<MemoryPeerTable>, DeviceEngine) {
        let registry = Arc::new(MemoryRegistry::new());
        let peers = Arc::new(MemoryPeerTable::new());
        let engine = DeviceEngine::new(
            registry.clone(),
            peers.clone(),
            AddressPools::new(v4, v6).unwrap(),
        );
        (registry, peers, engine)
    }

    #[tokio::test]
    async fn test_create_does_not_touch_peer_table() {
        let (registry, peers, engine) = engine(Some("10.44.0.0/24"), None);
        let device = engine
            .create_device(&Identity::subject("alice"), "laptop", KEY_A, None)
            .await
            .unwrap();

        assert_eq!(device.address, "10.44.0.2/32");
        assert_eq!(registry.len().await, 1);
        assert!(peers.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_name_and_bad_psk() {
        let (_, _, engine) = engine(Some("10.44.0.0/24"), None);
        let alice = Identity::subject("alice");

        let err = engine.create_device(&alice, "", KEY_A, None).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyName));

        let err = engine
            .create_device(&alice, "laptop", KEY_A, Some("short"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_, _, engine) = engine(Some("10.44.0.0/24"), None);
        let err = engine.delete_device("alice", "laptop").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_users_sorted_with_latest_display_name() {
        let (_, _, engine) = engine(Some("10.44.0.0/24"), None);
        let mut zed = Identity::subject("zed");
        zed.name = "Zed".to_string();
        engine.create_device(&zed, "a", KEY_A, None).await.unwrap();

        let mut alice = Identity::subject("alice");
        alice.name = "Alice".to_string();
        engine.create_device(&alice, "a", KEY_B, None).await.unwrap();
        alice.name = "Alice Liddell".to_string();
        engine.create_device(&alice, "b", KEY_C, None).await.unwrap();

        let users = engine.list_users().await.unwrap();
        assert_eq!(
            users,
            vec![
                User { name: "alice".into(), display_name: "Alice Liddell".into() },
                User { name: "zed".into(), display_name: "Zed".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_handle_events() {
        let (_, peers, engine) = engine(Some("10.44.0.0/24"), None);
        let device = engine
            .create_device(&Identity::subject("alice"), "laptop", KEY_A, None)
            .await
            .unwrap();

        engine.handle_event(RegistryEvent::Added(device.clone())).await;
        assert_eq!(
            peers.peer(KEY_A).await.unwrap().allowed_ips,
            vec!["10.44.0.2/32".parse::<IpNet>().unwrap()]
        );

        engine.delete_device("alice", "laptop").await.unwrap();
        engine.handle_event(RegistryEvent::Deleted(device)).await;
        assert!(peers.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_rejects_registered_public_key() {
        let (registry, _, engine) = engine(Some("10.44.0.0/24"), None);
        engine
            .create_device(&Identity::subject("alice"), "laptop", KEY_A, None)
            .await
            .unwrap();

        for (owner, name) in [("alice", "laptop-2"), ("bob", "laptop")] {
            let err = engine
                .create_device(&Identity::subject(owner), name, KEY_A, None)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::DuplicateKey));
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_deleted_event_keeps_peer_of_device_sharing_key() {
        // Two records with one key, as left behind by an older writer.
        let (registry, peers, engine) = engine(Some("10.44.0.0/24"), None);
        let laptop = engine
            .create_device(&Identity::subject("alice"), "laptop", KEY_A, None)
            .await
            .unwrap();
        let mut twin = laptop.clone();
        twin.name = "laptop-2".to_string();
        twin.address = "10.44.0.3/32".to_string();
        registry.save(&twin).await.unwrap();

        engine.handle_event(RegistryEvent::Added(laptop.clone())).await;
        engine.delete_device("alice", "laptop").await.unwrap();
        engine.handle_event(RegistryEvent::Deleted(laptop)).await;

        assert_eq!(
            peers.peer(KEY_A).await.unwrap().allowed_ips,
            vec!["10.44.0.3/32".parse::<IpNet>().unwrap()]
        );
        assert_eq!(peers.calls().removes, 0);
    }

    #[tokio::test]
    async fn test_full_reconcile_updates_changed_addresses() {
        let (_, peers, engine) = engine(Some("10.44.0.0/24"), None);
        engine
            .create_device(&Identity::subject("alice"), "laptop", KEY_A, None)
            .await
            .unwrap();
        peers
            .seed(Peer::new(KEY_A, vec!["10.44.0.99/32".parse().unwrap()]))
            .await;

        let stats = engine.full_reconcile().await.unwrap();
        assert_eq!(stats, ReconcileStats { removed: 0, upserted: 1, unchanged: 0, failed: 0 });
        assert_eq!(peers.calls().removes, 0);
        assert_eq!(
            peers.peer(KEY_A).await.unwrap().allowed_ips,
            vec!["10.44.0.2/32".parse::<IpNet>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_full_reconcile_fails_when_peer_table_unreachable() {
        let (_, peers, engine) = engine(Some("10.44.0.0/24"), None);
        peers.set_failing(true);
        let err = engine.full_reconcile().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_server_addresses() {
        let (_, _, engine) = engine(Some("10.44.0.0/24"), Some("fd00::/64"));
        let addrs: Vec<String> = engine.server_addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.44.0.1/24", "fd00::1/64"]);
    }
}
