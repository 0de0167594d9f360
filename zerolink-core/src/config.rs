//! Service configuration. Parses from TOML into a strongly-typed structure;
//! every field has a sensible default so embedded callers can start from
//! `ServiceConfig::default()` and override the few knobs they care about.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::error::Error;

/// How long between full binder refreshes, in milliseconds. Divided by 8
/// when multipath mode is active so new host interfaces are noticed faster.
pub const BIND_REFRESH_INTERVAL_MS: i64 = 30_000;
/// How often tap multicast subscriptions are re-scanned, in milliseconds.
pub const MULTICAST_CHECK_INTERVAL_MS: i64 = 5_000;
/// How often local interface addresses are re-published to the node.
pub const LOCAL_IFACE_CHECK_INTERVAL_MS: i64 = 60_000;
/// Cached peer hint files older than this many milliseconds are deleted.
pub const PEER_CACHE_EXPIRY_MS: i64 = 30 * 24 * 3600 * 1000;

/// Top-level configuration for one embedded service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// State directory (identity, auth token, caches). `None` keeps all
    /// state in memory; it is then lost on shutdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// Primary UDP port. 0 picks a random port in 20000-65535.
    pub primary_port: u16,

    /// Open a secondary port derived from the node address, used to dodge
    /// NAT mapping collisions between colocated nodes.
    pub allow_secondary_port: bool,

    /// Ask the local NAT for an external mapping on an auxiliary port.
    pub allow_port_mapping: bool,

    /// Host interface name prefixes never bound (in addition to the
    /// built-in loopback/tunnel prefixes).
    pub interface_blacklist: Vec<String>,

    /// Host addresses never bound, as (network, prefix length) pairs.
    pub cidr_blacklist: Vec<(IpAddr, u8)>,

    /// Addresses to bind regardless of interface enumeration. Mostly a
    /// test hook; also useful on hosts whose interface listing is wrong.
    pub explicit_bind: Vec<SocketAddr>,

    /// Aggressive path probing over every available interface pair.
    pub multipath: bool,

    /// Cache network configs under `networks.d/` and re-join on start.
    pub network_caching: bool,

    /// Cache peer hints under `peers.d/`.
    pub peer_caching: bool,

    /// Event queue capacity before producers start dropping.
    pub event_queue_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            home: None,
            primary_port: 0,
            allow_secondary_port: true,
            allow_port_mapping: true,
            interface_blacklist: Vec::new(),
            cidr_blacklist: Vec::new(),
            explicit_bind: Vec::new(),
            multipath: false,
            network_caching: true,
            peer_caching: true,
            event_queue_capacity: 1024,
        }
    }
}

impl ServiceConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        let data = std::fs::read_to_string(&path).map_err(Error::from)?;
        Ok(toml::from_str::<ServiceConfig>(&data)?)
    }

    /// Builder-style: set the state directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Builder-style: set the primary port.
    pub fn with_primary_port(mut self, port: u16) -> Self {
        self.primary_port = port;
        self
    }

    /// Builder-style: add an explicit bind address.
    pub fn with_explicit_bind(mut self, addr: SocketAddr) -> Self {
        self.explicit_bind.push(addr);
        self
    }

    /// Effective binder refresh interval given the multipath flag.
    pub fn bind_refresh_interval_ms(&self) -> i64 {
        if self.multipath {
            BIND_REFRESH_INTERVAL_MS / 8
        } else {
            BIND_REFRESH_INTERVAL_MS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = ServiceConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: ServiceConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.primary_port, 0);
        assert!(back.network_caching);
        assert!(back.home.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: ServiceConfig = toml::from_str("primary_port = 9993\nmultipath = true").unwrap();
        assert_eq!(cfg.primary_port, 9993);
        assert!(cfg.multipath);
        assert!(cfg.allow_secondary_port);
        assert_eq!(cfg.bind_refresh_interval_ms(), BIND_REFRESH_INTERVAL_MS / 8);
    }
}
