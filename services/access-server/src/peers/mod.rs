//! Tunnel peer table backends.
//!
//! The peer table is the live set of WireGuard peers on the tunnel endpoint.
//! It is a cache of the registry and is always reconciled from it.

mod memory;
mod uapi;

pub use memory::{MemoryPeerTable, PeerCalls};
pub use uapi::UapiPeerTable;

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;

use crate::device::Peer;

/// Errors from the tunnel endpoint.
#[derive(Debug, Error)]
pub enum PeerError {
    /// No peer with the given key.
    #[error("peer not found: {0}")]
    NotFound(String),

    /// A key was not valid WireGuard key material.
    #[error("invalid key: {0}")]
    InvalidKey(#[from] wga_networking::NetworkError),

    /// The control socket could not be reached.
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint sent something we could not parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The endpoint rejected the request.
    #[error("tunnel endpoint returned errno {0}")]
    Errno(i32),

    /// The endpoint is not usable.
    #[error("tunnel endpoint unavailable: {0}")]
    Unavailable(String),
}

/// Capability interface over a tunnel endpoint's peer table.
#[async_trait]
pub trait PeerTable: Send + Sync {
    /// Add a peer, or replace the preshared key and allowed addresses of an
    /// existing one.
    async fn add_peer(
        &self,
        public_key: &str,
        preshared_key: Option<&str>,
        allowed_ips: &[IpNet],
    ) -> Result<(), PeerError>;

    /// Remove a peer. Removing an absent peer succeeds.
    async fn remove_peer(&self, public_key: &str) -> Result<(), PeerError>;

    /// Current peers with their live counters.
    async fn list_peers(&self) -> Result<Vec<Peer>, PeerError>;

    /// The endpoint's own public key (base64).
    async fn public_key(&self) -> Result<String, PeerError>;

    /// Check that the endpoint is reachable.
    async fn ping(&self) -> Result<(), PeerError>;
}
