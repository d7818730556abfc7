//! In-process peer table.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use tokio::sync::RwLock;
use tracing::debug;
use wga_networking::WgKey;

use super::{PeerError, PeerTable};
use crate::device::Peer;

/// Public key reported when none is configured.
pub const DEV_PUBLIC_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Number of mutating calls a [`MemoryPeerTable`] has received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCalls {
    pub adds: usize,
    pub removes: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    peer: Peer,
    preshared_key: Option<String>,
}

/// Peer table held in memory.
///
/// Used when no tunnel endpoint is configured and as a spy in tests: every
/// `add_peer`/`remove_peer` call is counted, and peers and their live stats
/// can be seeded without being counted.
pub struct MemoryPeerTable {
    peers: RwLock<BTreeMap<String, Entry>>,
    public_key: String,
    adds: AtomicUsize,
    removes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryPeerTable {
    pub fn new() -> Self {
        Self::with_public_key(DEV_PUBLIC_KEY)
    }

    /// Create a table reporting `public_key` as the endpoint's own key.
    pub fn with_public_key(public_key: impl Into<String>) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            public_key: public_key.into(),
            adds: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every call fail with [`PeerError::Unavailable`] (or stop doing so).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Mutating calls received so far.
    pub fn calls(&self) -> PeerCalls {
        PeerCalls {
            adds: self.adds.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
        }
    }

    pub fn reset_calls(&self) {
        self.adds.store(0, Ordering::SeqCst);
        self.removes.store(0, Ordering::SeqCst);
    }

    /// Insert a peer directly, bypassing the call counters.
    pub async fn seed(&self, peer: Peer) {
        self.peers.write().await.insert(
            peer.public_key.clone(),
            Entry {
                peer,
                preshared_key: None,
            },
        );
    }

    /// Record live traffic for a peer, as the tunnel endpoint would after a
    /// handshake. Returns false if the peer is not present.
    pub async fn observe(
        &self,
        public_key: &str,
        endpoint: Option<SocketAddr>,
        last_handshake_time: Option<DateTime<Utc>>,
        receive_bytes: i64,
        transmit_bytes: i64,
    ) -> bool {
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(public_key) else {
            return false;
        };
        entry.peer.endpoint = endpoint;
        entry.peer.last_handshake_time = last_handshake_time;
        entry.peer.receive_bytes = receive_bytes;
        entry.peer.transmit_bytes = transmit_bytes;
        true
    }

    /// Look up a single peer.
    pub async fn peer(&self, public_key: &str) -> Option<Peer> {
        self.peers
            .read()
            .await
            .get(public_key)
            .map(|e| e.peer.clone())
    }

    /// Preshared key currently set for a peer.
    pub async fn preshared_key(&self, public_key: &str) -> Option<String> {
        self.peers
            .read()
            .await
            .get(public_key)
            .and_then(|e| e.preshared_key.clone())
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), PeerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PeerError::Unavailable(
                "memory peer table marked failing".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryPeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTable for MemoryPeerTable {
    async fn add_peer(
        &self,
        public_key: &str,
        preshared_key: Option<&str>,
        allowed_ips: &[IpNet],
    ) -> Result<(), PeerError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        WgKey::from_base64(public_key)?;
        if let Some(psk) = preshared_key {
            WgKey::from_base64(psk)?;
        }

        let mut peers = self.peers.write().await;
        let entry = peers.entry(public_key.to_string()).or_insert_with(|| Entry {
            peer: Peer::new(public_key, Vec::new()),
            preshared_key: None,
        });
        entry.peer.allowed_ips = allowed_ips.to_vec();
        entry.preshared_key = preshared_key.map(str::to_string);

        debug!(public_key = %public_key, "Upserted peer");
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), PeerError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        if self.peers.write().await.remove(public_key).is_some() {
            debug!(public_key = %public_key, "Removed peer");
        }
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<Peer>, PeerError> {
        self.check_available()?;
        Ok(self
            .peers
            .read()
            .await
            .values()
            .map(|e| e.peer.clone())
            .collect())
    }

    async fn public_key(&self) -> Result<String, PeerError> {
        self.check_available()?;
        Ok(self.public_key.clone())
    }

    async fn ping(&self) -> Result<(), PeerError> {
        self.check_available()
    }
}
