//! Networking utilities for the access server.
//!
//! This library provides helpers for:
//! - IPAM (IP Address Management) over dual-stack device address pools
//! - Parsing the comma-separated address strings stored on device records
//! - WireGuard key validation and encoding (base64 / hex)
//!
//! Everything here is pure computation. Callers supply the snapshot of
//! addresses already in use; serialising concurrent allocations is the
//! caller's job.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// One or more configured pools have no free address left.
    #[error("there are no free IP addresses in the vpn subnet(s): {}", .0.join(", "))]
    PoolExhausted(Vec<String>),

    /// Invalid WireGuard key.
    #[error("invalid WireGuard key: {0}")]
    InvalidKey(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

// ============================================================================
// IPAM (IP Address Management)
// ============================================================================

/// Offset of the first address handed to devices.
///
/// Offset 0 is the network address and offset 1 belongs to the tunnel
/// endpoint itself.
pub const FIRST_DEVICE_OFFSET: u32 = 2;

/// Separator between the IPv4 and IPv6 prefix in a stored device address.
pub const ADDRESS_SEPARATOR: &str = ", ";

/// Dual-stack address pools devices are allocated from.
///
/// At least one family is always configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPools {
    ipv4: Option<Ipv4Net>,
    ipv6: Option<Ipv6Net>,
}

impl AddressPools {
    /// Parse pools from CIDR notation (e.g. "10.44.0.0/24", "fd00::/64").
    ///
    /// Host bits are masked off, so "10.44.0.7/24" becomes "10.44.0.0/24".
    pub fn new(ipv4: Option<&str>, ipv6: Option<&str>) -> Result<Self, NetworkError> {
        let ipv4 = ipv4
            .map(|s| {
                Ipv4Net::from_str(s.trim())
                    .map(|net| net.trunc())
                    .map_err(|_| NetworkError::InvalidPrefix(s.to_string()))
            })
            .transpose()?;

        let ipv6 = ipv6
            .map(|s| {
                Ipv6Net::from_str(s.trim())
                    .map(|net| net.trunc())
                    .map_err(|_| NetworkError::InvalidPrefix(s.to_string()))
            })
            .transpose()?;

        if ipv4.is_none() && ipv6.is_none() {
            return Err(NetworkError::Config(
                "at least one of the IPv4 or IPv6 pools must be configured".to_string(),
            ));
        }

        Ok(Self { ipv4, ipv6 })
    }

    /// The IPv4 pool, if configured.
    pub fn ipv4(&self) -> Option<Ipv4Net> {
        self.ipv4
    }

    /// The IPv6 pool, if configured.
    pub fn ipv6(&self) -> Option<Ipv6Net> {
        self.ipv6
    }

    /// Addresses of the tunnel endpoint itself, one per configured family.
    ///
    /// The endpoint owns the address right after the network address and
    /// carries the pool's prefix length so it routes the whole pool.
    pub fn server_addresses(&self) -> Vec<IpNet> {
        let mut out = Vec::with_capacity(2);

        if let Some(pool) = self.ipv4 {
            let addr = Ipv4Addr::from(u32::from(pool.network()).wrapping_add(1));
            if let Ok(net) = Ipv4Net::new(addr, pool.prefix_len()) {
                out.push(IpNet::V4(net));
            }
        }

        if let Some(pool) = self.ipv6 {
            let addr = Ipv6Addr::from(u128::from(pool.network()).wrapping_add(1));
            if let Ok(net) = Ipv6Net::new(addr, pool.prefix_len()) {
                out.push(IpNet::V6(net));
            }
        }

        out
    }

    /// Pick the next free address in every configured pool.
    ///
    /// `existing` is the stored address string of every device currently
    /// registered. Unparseable entries are skipped rather than failing the
    /// allocation, since they cannot collide with a well-formed address.
    ///
    /// The allocation only succeeds if every configured family has a free
    /// address; a single-family result is never returned when the other
    /// configured family is exhausted.
    pub fn allocate<'a, I>(&self, existing: I) -> Result<DeviceAddress, NetworkError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut used_v4 = HashSet::new();
        let mut used_v6 = HashSet::new();

        for address in existing {
            for prefix in parse_device_addresses(address).unwrap_or_default() {
                match prefix.addr() {
                    IpAddr::V4(v4) => {
                        used_v4.insert(v4);
                    }
                    IpAddr::V6(v6) => {
                        used_v6.insert(v6);
                    }
                }
            }
        }

        if let Some(pool) = self.ipv4 {
            used_v4.insert(pool.network());
            used_v4.insert(Ipv4Addr::from(u32::from(pool.network()).wrapping_add(1)));
        }
        if let Some(pool) = self.ipv6 {
            used_v6.insert(pool.network());
            used_v6.insert(Ipv6Addr::from(u128::from(pool.network()).wrapping_add(1)));
        }

        let ipv4 = self.ipv4.map(|pool| (pool, next_free_ipv4(pool, &used_v4)));
        let ipv6 = self.ipv6.map(|pool| (pool, next_free_ipv6(pool, &used_v6)));

        let mut exhausted = Vec::new();
        if let Some((pool, None)) = ipv4 {
            exhausted.push(pool.to_string());
        }
        if let Some((pool, None)) = ipv6 {
            exhausted.push(pool.to_string());
        }
        if !exhausted.is_empty() {
            return Err(NetworkError::PoolExhausted(exhausted));
        }

        Ok(DeviceAddress {
            ipv4: ipv4.and_then(|(_, addr)| addr),
            ipv6: ipv6.and_then(|(_, addr)| addr),
        })
    }
}

/// Linear scan from the first device address up to (not including) the
/// broadcast address.
fn next_free_ipv4(pool: Ipv4Net, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    let first = u32::from(pool.network()).saturating_add(FIRST_DEVICE_OFFSET);
    let last = u32::from(pool.broadcast());

    (first..last)
        .map(Ipv4Addr::from)
        .find(|addr| !used.contains(addr))
}

/// Linear scan from the first device address up to (not including) the
/// last address of the prefix.
fn next_free_ipv6(pool: Ipv6Net, used: &HashSet<Ipv6Addr>) -> Option<Ipv6Addr> {
    let first = u128::from(pool.network()).saturating_add(u128::from(FIRST_DEVICE_OFFSET));
    let last = u128::from(pool.broadcast());

    (first..last)
        .map(Ipv6Addr::from)
        .find(|addr| !used.contains(addr))
}

/// Address assigned to a single device.
///
/// Formats as the comma-joined single-host prefixes, IPv4 first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAddress {
    /// IPv4 host address, if the IPv4 pool is configured.
    pub ipv4: Option<Ipv4Addr>,

    /// IPv6 host address, if the IPv6 pool is configured.
    pub ipv6: Option<Ipv6Addr>,
}

impl DeviceAddress {
    /// Single-host prefixes (/32 and /128), IPv4 first.
    pub fn prefixes(&self) -> Vec<IpNet> {
        let mut out = Vec::with_capacity(2);
        if let Some(v4) = self.ipv4 {
            out.push(IpNet::V4(Ipv4Net::from(v4)));
        }
        if let Some(v6) = self.ipv6 {
            out.push(IpNet::V6(Ipv6Net::from(v6)));
        }
        out
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .prefixes()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(ADDRESS_SEPARATOR);
        f.write_str(&joined)
    }
}

/// Parse a stored device address ("10.44.0.2/32, fd00::2/128").
///
/// Entries are split on commas and trimmed. A bare address without a prefix
/// length is treated as a single-host prefix.
pub fn parse_device_addresses(s: &str) -> Result<Vec<IpNet>, NetworkError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part.contains('/') {
                IpNet::from_str(part).map_err(|_| NetworkError::InvalidPrefix(part.to_string()))
            } else {
                IpAddr::from_str(part)
                    .map(IpNet::from)
                    .map_err(|_| NetworkError::InvalidAddress(part.to_string()))
            }
        })
        .collect()
}

// ============================================================================
// WireGuard Keys
// ============================================================================

/// Raw length of a WireGuard (Curve25519) key.
pub const WG_KEY_LEN: usize = 32;

/// A WireGuard key (public or preshared).
///
/// The canonical text form is standard base64 with padding. Parsing is strict:
/// the trailing bits of the final symbol must be zero, so every 32-byte key
/// has exactly one accepted encoding.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WgKey([u8; WG_KEY_LEN]);

impl WgKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; WG_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a base64-encoded string.
    pub fn from_base64(s: &str) -> Result<Self, NetworkError> {
        let decoded = BASE64_STANDARD
            .decode(s)
            .map_err(|e| NetworkError::InvalidKey(format!("invalid base64 ({e})")))?;

        Self::from_vec(decoded)
    }

    /// Parse from the lowercase hex form used by the WireGuard control protocol.
    pub fn from_hex(s: &str) -> Result<Self, NetworkError> {
        let decoded =
            hex::decode(s).map_err(|e| NetworkError::InvalidKey(format!("invalid hex ({e})")))?;

        Self::from_vec(decoded)
    }

    fn from_vec(decoded: Vec<u8>) -> Result<Self, NetworkError> {
        let bytes: [u8; WG_KEY_LEN] = decoded.try_into().map_err(|v: Vec<u8>| {
            NetworkError::InvalidKey(format!("key must be {WG_KEY_LEN} bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; WG_KEY_LEN] {
        &self.0
    }

    /// Canonical base64 form.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for WgKey {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

// Keys double as preshared secrets; keep them out of debug output.
impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WgKey(..)")
    }
}

/// Check that a string is a valid base64 WireGuard key.
pub fn validate_key(s: &str) -> Result<(), NetworkError> {
    WgKey::from_base64(s).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ZERO_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    #[test]
    fn test_pools_mask_host_bits() {
        let pools = AddressPools::new(Some("10.44.0.7/24"), Some("fd00::9/64")).unwrap();
        assert_eq!(pools.ipv4().unwrap().to_string(), "10.44.0.0/24");
        assert_eq!(pools.ipv6().unwrap().to_string(), "fd00::/64");
    }

    #[test]
    fn test_pools_require_a_family() {
        let err = AddressPools::new(None, None).unwrap_err();
        assert!(matches!(err, NetworkError::Config(_)));
    }

    #[test]
    fn test_pools_reject_garbage() {
        assert!(matches!(
            AddressPools::new(Some("10.44.0.0"), None),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            AddressPools::new(None, Some("10.0.0.0/8")),
            Err(NetworkError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_server_addresses() {
        let pools = AddressPools::new(Some("10.44.0.0/24"), Some("fd00::/64")).unwrap();
        let servers: Vec<String> = pools
            .server_addresses()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(servers, vec!["10.44.0.1/24", "fd00::1/64"]);
    }

    #[test]
    fn test_allocate_first_free_ipv4() {
        let pools = AddressPools::new(Some("10.0.0.0/30"), None).unwrap();

        let addr = pools.allocate(std::iter::empty()).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.2/32");

        // .3 is the broadcast address and never handed out
        let err = pools.allocate(["10.0.0.2/32"]).unwrap_err();
        assert_eq!(err, NetworkError::PoolExhausted(vec!["10.0.0.0/30".into()]));
    }

    #[test]
    fn test_allocate_skips_used_addresses() {
        let pools = AddressPools::new(Some("10.44.0.0/24"), None).unwrap();
        let existing = ["10.44.0.2/32", "10.44.0.4/32", "garbage"];

        let addr = pools.allocate(existing).unwrap();
        assert_eq!(addr.ipv4, Some(Ipv4Addr::new(10, 44, 0, 3)));
        assert_eq!(addr.ipv6, None);
    }

    #[test]
    fn test_allocate_dual_stack() {
        let pools = AddressPools::new(Some("10.44.0.0/24"), Some("fd00::/64")).unwrap();
        let existing = ["10.44.0.2/32, fd00::2/128"];

        let addr = pools.allocate(existing).unwrap();
        assert_eq!(addr.to_string(), "10.44.0.3/32, fd00::3/128");
    }

    #[test]
    fn test_allocate_ipv6_only() {
        let pools = AddressPools::new(None, Some("fd00::/120")).unwrap();

        let addr = pools.allocate(std::iter::empty()).unwrap();
        assert_eq!(addr.to_string(), "fd00::2/128");
    }

    #[test]
    fn test_allocate_dual_stack_is_all_or_nothing() {
        // IPv4 has one free address, IPv6 has none
        let pools = AddressPools::new(Some("10.0.0.0/29"), Some("fd00::/126")).unwrap();
        let existing = ["10.0.0.2/32, fd00::2/128"];

        let err = pools.allocate(existing).unwrap_err();
        assert_eq!(err, NetworkError::PoolExhausted(vec!["fd00::/126".into()]));

        // and the other way around
        let pools = AddressPools::new(Some("10.0.0.0/30"), Some("fd00::/120")).unwrap();
        let existing = ["10.0.0.2/32, fd00::2/128"];

        let err = pools.allocate(existing).unwrap_err();
        assert_eq!(err, NetworkError::PoolExhausted(vec!["10.0.0.0/30".into()]));
    }

    #[test]
    fn test_allocate_tiny_pools_are_exhausted() {
        let pools = AddressPools::new(Some("10.0.0.0/31"), Some("fd00::/127")).unwrap();
        let err = pools.allocate(std::iter::empty()).unwrap_err();
        assert_eq!(
            err,
            NetworkError::PoolExhausted(vec!["10.0.0.0/31".into(), "fd00::/127".into()])
        );
    }

    #[rstest]
    #[case("10.44.0.2/32", vec!["10.44.0.2/32"])]
    #[case("10.44.0.2/32,fd00::2/128", vec!["10.44.0.2/32", "fd00::2/128"])]
    #[case("  10.44.0.2/32 ,  fd00::2/128 ", vec!["10.44.0.2/32", "fd00::2/128"])]
    #[case("10.44.0.2", vec!["10.44.0.2/32"])]
    #[case("", vec![])]
    fn test_parse_device_addresses(#[case] input: &str, #[case] expected: Vec<&str>) {
        let parsed: Vec<String> = parse_device_addresses(input)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_parse_device_addresses_rejects_garbage() {
        assert!(parse_device_addresses("10.44.0.2/32, nope").is_err());
        assert!(parse_device_addresses("10.44.0.2/40").is_err());
    }

    #[rstest]
    #[case(ZERO_KEY, true)]
    #[case("xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=", true)]
    // final symbol carries non-zero trailing bits
    #[case("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAB=", false)]
    // missing padding
    #[case("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", false)]
    // url-safe alphabet
    #[case("_____________________________________________w=", false)]
    #[case("AAAA", false)]
    #[case("", false)]
    #[case("not a key at all", false)]
    fn test_key_validation(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(validate_key(input).is_ok(), valid, "{input}");
    }

    #[test]
    fn test_key_hex_roundtrip() {
        let key = WgKey::from_base64("xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=").unwrap();
        let hex_form = key.to_hex();
        assert_eq!(hex_form.len(), 64);
        assert_eq!(WgKey::from_hex(&hex_form).unwrap(), key);
        assert_eq!(key.to_string(), "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=");
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = WgKey::from_base64(ZERO_KEY).unwrap();
        assert_eq!(format!("{key:?}"), "WgKey(..)");
    }
}
