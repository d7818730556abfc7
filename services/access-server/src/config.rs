//! Configuration for the access server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use wga_networking::AddressPools;

use crate::sync::{SyncOptions, DEFAULT_INACTIVE_GRACE};

/// Access server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Registry storage URI (`memory://`, `file:///dir`, `sqlite3:///db`,
    /// `postgres://...`).
    pub storage: String,

    /// IPv4 device pool; `None` disables IPv4.
    pub vpn_cidr: Option<String>,

    /// IPv6 device pool; `None` disables IPv6.
    pub vpn_cidr_v6: Option<String>,

    /// Userspace WireGuard control socket. Without one an in-memory peer
    /// table is used.
    pub wireguard_socket: Option<PathBuf>,

    pub disable_metadata: bool,
    pub inactive_device_deletion_enabled: bool,
    pub inactive_device_grace_period: Duration,
    pub metadata_interval: Duration,
    pub inactive_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("WGA_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let storage = lookup("WGA_STORAGE").unwrap_or_else(|| "memory://".to_string());

        // Unset means default; set-but-empty disables the family.
        let pool = |key: &str, default: &str| match lookup(key) {
            None => Some(default.to_string()),
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v.trim().to_string()),
        };
        let vpn_cidr = pool("WGA_VPN_CIDR", "10.44.0.0/24");
        let vpn_cidr_v6 = pool("WGA_VPN_CIDRV6", "fd48:4c4:7aa9::/64");

        if vpn_cidr.is_none() && vpn_cidr_v6.is_none() {
            bail!("at least one of WGA_VPN_CIDR or WGA_VPN_CIDRV6 must be set");
        }

        let wireguard_socket = lookup("WGA_WIREGUARD_SOCKET")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let disable_metadata = parse_bool(&lookup, "WGA_DISABLE_METADATA", false)?;
        let inactive_device_deletion_enabled =
            parse_bool(&lookup, "WGA_INACTIVE_DEVICE_DELETION_ENABLED", false)?;
        let inactive_device_grace_period = parse_secs(
            &lookup,
            "WGA_INACTIVE_DEVICE_GRACE_PERIOD",
            DEFAULT_INACTIVE_GRACE,
        )?;
        let metadata_interval =
            parse_secs(&lookup, "WGA_METADATA_INTERVAL_SECS", Duration::from_secs(30))?;
        let inactive_interval =
            parse_secs(&lookup, "WGA_INACTIVE_INTERVAL_SECS", Duration::from_secs(30))?;

        if metadata_interval.is_zero() || inactive_interval.is_zero() {
            bail!("loop intervals must be greater than zero");
        }

        Ok(Self {
            log_level,
            storage,
            vpn_cidr,
            vpn_cidr_v6,
            wireguard_socket,
            disable_metadata,
            inactive_device_deletion_enabled,
            inactive_device_grace_period,
            metadata_interval,
            inactive_interval,
        })
    }

    /// Parse the configured pools.
    pub fn address_pools(&self) -> Result<AddressPools> {
        AddressPools::new(self.vpn_cidr.as_deref(), self.vpn_cidr_v6.as_deref())
            .context("invalid VPN address pool")
    }

    /// Background loop settings derived from this configuration.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            disable_metadata: self.disable_metadata,
            disable_inactivity_pruning: !self.inactive_device_deletion_enabled,
            inactive_grace: self.inactive_device_grace_period,
            metadata_interval: self.metadata_interval,
            prune_interval: self.inactive_interval,
        }
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key}: expected a boolean, got '{other}'"),
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{key}: expected seconds, got '{raw}'"))?;
            Ok(Duration::from_secs(secs))
        }
    }
}
