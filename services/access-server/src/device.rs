//! Device and peer records.
//!
//! A [`Device`] is the registry's record of a tunnel peer owned by a user.
//! A [`Peer`] is the live view of the same key as reported by the tunnel
//! endpoint. The registry is authoritative; the peer table only caches
//! `public_key`, `preshared_key` and `address`.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use wga_networking::{parse_device_addresses, NetworkError};
use wga_reconcile::{is_fresh, CONNECTED_WINDOW};

/// A registered device.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Opaque subject id from the identity provider.
    pub owner: String,

    /// Display name of the owner at the time the device was last written.
    #[serde(default)]
    pub owner_name: String,

    #[serde(default)]
    pub owner_email: String,

    #[serde(default)]
    pub owner_provider: String,

    /// Device name, unique per owner.
    pub name: String,

    /// WireGuard public key (base64).
    pub public_key: String,

    /// Optional WireGuard preshared key (base64).
    #[serde(default)]
    pub preshared_key: Option<String>,

    /// One or two single-host prefixes, comma separated, IPv4 first.
    pub address: String,

    pub created_at: DateTime<Utc>,

    // Metadata below is derived from the peer table by the metadata collector.
    #[serde(default)]
    pub last_handshake_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub receive_bytes: i64,

    #[serde(default)]
    pub transmit_bytes: i64,

    /// Last observed remote endpoint (ip:port).
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("owner", &self.owner)
            .field("owner_name", &self.owner_name)
            .field("owner_email", &self.owner_email)
            .field("owner_provider", &self.owner_provider)
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .field(
                "preshared_key",
                &self.preshared_key.as_ref().map(|_| "[redacted]"),
            )
            .field("address", &self.address)
            .field("created_at", &self.created_at)
            .field("last_handshake_time", &self.last_handshake_time)
            .field("receive_bytes", &self.receive_bytes)
            .field("transmit_bytes", &self.transmit_bytes)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Device {
    /// Parsed allowed addresses for this device.
    pub fn addresses(&self) -> Result<Vec<IpNet>, NetworkError> {
        parse_device_addresses(&self.address)
    }

    /// Whether the device has handshaken within [`CONNECTED_WINDOW`] of `now`.
    pub fn connected_at(&self, now: DateTime<Utc>) -> bool {
        is_fresh(self.last_handshake_time, now, CONNECTED_WINDOW)
    }

    /// Whether the device is connected right now.
    pub fn connected(&self) -> bool {
        self.connected_at(Utc::now())
    }
}

/// Identity of the user creating a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    /// Stable subject id; becomes [`Device::owner`].
    pub subject: String,
    pub name: String,
    pub email: String,
    pub provider: String,
}

impl Identity {
    /// Identity carrying only a subject.
    pub fn subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }
}

/// A distinct device owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Owner subject id.
    pub name: String,

    /// Most recently observed display name.
    pub display_name: String,
}

/// A peer as reported by the tunnel endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    /// WireGuard public key (base64).
    pub public_key: String,

    /// Remote endpoint; `None` until the peer has handshaken with us.
    pub endpoint: Option<SocketAddr>,

    /// Allowed addresses currently routed to this peer.
    pub allowed_ips: Vec<IpNet>,

    pub last_handshake_time: Option<DateTime<Utc>>,
    pub receive_bytes: i64,
    pub transmit_bytes: i64,
}

impl Peer {
    /// A peer with no traffic and no handshake yet.
    pub fn new(public_key: impl Into<String>, allowed_ips: Vec<IpNet>) -> Self {
        Self {
            public_key: public_key.into(),
            endpoint: None,
            allowed_ips,
            last_handshake_time: None,
            receive_bytes: 0,
            transmit_bytes: 0,
        }
    }
}
