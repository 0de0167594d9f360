//! Peer records and path bookkeeping.

use std::net::SocketAddr;

use zerolink_core::{PathInfo, PeerInfo, PeerRole, MAX_PEER_PATHS};

use crate::node::LocalSocket;
use crate::wire::SessionKey;

/// A path is considered dead after this long without a receive.
pub const PATH_EXPIRY_MS: i64 = 10 * 60 * 1000;
/// Keepalive cadence per active path.
pub const PATH_KEEPALIVE_MS: i64 = 60 * 1000;
/// Peers silent for this long are dropped entirely.
pub const PEER_EXPIRY_MS: i64 = 30 * 60 * 1000;

/// One learned way of reaching a peer.
#[derive(Debug, Clone)]
pub struct Path {
    pub endpoint: SocketAddr,
    pub socket: LocalSocket,
    pub last_send: i64,
    pub last_receive: i64,
    pub trusted_path_id: u64,
    pub preferred: bool,
}

impl Path {
    pub fn expired(&self, now: i64) -> bool {
        now - self.last_receive > PATH_EXPIRY_MS
    }

    pub fn info(&self, now: i64) -> PathInfo {
        PathInfo {
            endpoint: self.endpoint,
            last_send: self.last_send,
            last_receive: self.last_receive,
            trusted_path_id: self.trusted_path_id,
            expired: self.expired(now),
            preferred: self.preferred,
        }
    }
}

/// A remote node we have exchanged HELLOs with.
pub struct Peer {
    pub address: zerolink_core::NodeId,
    pub key: SessionKey,
    pub version: Option<(u16, u16, u16)>,
    /// One-way latency estimate in milliseconds, -1 when unmeasured.
    pub latency: i32,
    pub role: PeerRole,
    pub paths: Vec<Path>,
    pub last_heard: i64,
    pub last_hello_sent: i64,
    /// Next send counter for packets sealed to this peer.
    pub send_counter: u64,
}

impl Peer {
    pub fn new(address: zerolink_core::NodeId, key: SessionKey, now: i64) -> Self {
        Self {
            address,
            key,
            version: None,
            latency: -1,
            role: PeerRole::Leaf,
            paths: Vec::new(),
            last_heard: now,
            last_hello_sent: 0,
            send_counter: 0,
        }
    }

    pub fn next_counter(&mut self) -> u64 {
        self.send_counter += 1;
        self.send_counter
    }

    /// Record a receive on `(socket, endpoint)`, learning the path when it
    /// is new. Returns true when a new path was added.
    pub fn learn_path(&mut self, socket: LocalSocket, endpoint: SocketAddr, now: i64) -> bool {
        self.last_heard = now;
        if let Some(p) = self
            .paths
            .iter_mut()
            .find(|p| p.endpoint == endpoint && p.socket == socket)
        {
            p.last_receive = now;
            return false;
        }
        if self.paths.len() >= MAX_PEER_PATHS {
            // Replace the stalest path rather than refusing the new one
            self.paths
                .sort_by_key(|p| std::cmp::Reverse(p.last_receive));
            self.paths.pop();
        }
        let preferred = self.paths.iter().all(|p| p.expired(now));
        self.paths.push(Path {
            endpoint,
            socket,
            last_send: 0,
            last_receive: now,
            trusted_path_id: 0,
            preferred,
        });
        true
    }

    /// Drop expired paths. Returns true when the live path count changed
    /// from nonzero to zero or vice versa is left to the caller to judge.
    pub fn prune_paths(&mut self, now: i64) {
        self.paths.retain(|p| !p.expired(now));
        if !self.paths.is_empty() && !self.paths.iter().any(|p| p.preferred) {
            // Promote the most recently heard path
            if let Some(best) = self
                .paths
                .iter_mut()
                .max_by_key(|p| p.last_receive)
            {
                best.preferred = true;
            }
        }
    }

    /// The path used for normal sends: preferred first, then freshest.
    pub fn best_path_mut(&mut self, now: i64) -> Option<&mut Path> {
        self.paths
            .iter_mut()
            .filter(|p| !p.expired(now))
            .max_by_key(|p| (p.preferred, p.last_receive))
    }

    pub fn alive_path_count(&self, now: i64) -> usize {
        self.paths.iter().filter(|p| !p.expired(now)).count()
    }

    /// Value snapshot with stable path order: preferred first, then most
    /// recently heard from.
    pub fn info(&self, now: i64) -> PeerInfo {
        let mut paths: Vec<PathInfo> = self.paths.iter().map(|p| p.info(now)).collect();
        paths.sort_by_key(|p| (std::cmp::Reverse(p.preferred), std::cmp::Reverse(p.last_receive)));
        PeerInfo {
            address: self.address,
            version: self.version,
            latency: self.latency,
            role: self.role,
            paths,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use zerolink_core::NodeId;

    fn peer() -> Peer {
        Peer::new(
            NodeId::new(0x1234567890),
            SessionKey::derive(&[1u8; 32], NodeId::new(1), NodeId::new(2)),
            1_000,
        )
    }

    fn sa(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], port))
    }

    #[test]
    fn learn_path_dedupes() {
        let mut p = peer();
        assert!(p.learn_path(LocalSocket(1), sa(9000), 1_000));
        assert!(!p.learn_path(LocalSocket(1), sa(9000), 2_000));
        assert_eq!(p.paths.len(), 1);
        assert_eq!(p.paths[0].last_receive, 2_000);
    }

    #[test]
    fn path_cap_replaces_stalest() {
        let mut p = peer();
        for i in 0..MAX_PEER_PATHS as u16 {
            p.learn_path(LocalSocket(1), sa(9000 + i), 1_000 + i as i64);
        }
        assert_eq!(p.paths.len(), MAX_PEER_PATHS);
        p.learn_path(LocalSocket(1), sa(20_000), 5_000);
        assert_eq!(p.paths.len(), MAX_PEER_PATHS);
        assert!(p.paths.iter().any(|q| q.endpoint == sa(20_000)));
        assert!(!p.paths.iter().any(|q| q.endpoint == sa(9000)));
    }

    #[test]
    fn snapshot_orders_preferred_first() {
        let mut p = peer();
        p.learn_path(LocalSocket(1), sa(1), 1_000);
        p.learn_path(LocalSocket(1), sa(2), 2_000);
        p.paths[1].preferred = false;
        p.paths[0].preferred = true;
        let info = p.info(3_000);
        assert!(info.paths[0].preferred);
        assert_eq!(info.paths[0].endpoint, sa(1));
    }

    #[test]
    fn expiry_and_promotion() {
        let mut p = peer();
        p.learn_path(LocalSocket(1), sa(1), 1_000);
        p.learn_path(LocalSocket(1), sa(2), 2_000);
        let later = 2_000 + PATH_EXPIRY_MS + 1;
        assert_eq!(p.alive_path_count(later), 0);
        p.learn_path(LocalSocket(1), sa(3), later);
        p.prune_paths(later);
        assert_eq!(p.paths.len(), 1);
        assert!(p.paths[0].preferred);
    }
}
