//! Virtual Ethernet tap: the per-network bridge between the overlay node
//! and the userspace stack.
//!
//! Inbound, the node hands the tap a decrypted frame body; the tap
//! synthesizes the Ethernet header and submits it to the stack's
//! ingress. Outbound, the stack emits a complete Ethernet frame through
//! the tap's transmit hook, which splits the header back apart and gives
//! the node the pieces it encrypts.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use zerolink_core::{Mac, MulticastGroup, NetworkId, Result};
use zerolink_node::{LocalSocket, Node};
use zerolink_stack::{FrameSink, NetifId, StackDriver};

const ETHERNET_HEADER_LEN: usize = 14;

/// Milliseconds since the Unix epoch; the node's notion of "now".
pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The stack's transmit hook for one tap: split the Ethernet header and
/// hand the frame to the node for encryption and transmission.
struct TapTx {
    nwid: NetworkId,
    node: Arc<Node>,
}

impl FrameSink for TapTx {
    fn transmit(&self, frame: &[u8]) {
        if frame.len() < ETHERNET_HEADER_LEN {
            return;
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        let mut src = [0u8; 6];
        src.copy_from_slice(&frame[6..12]);
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        self.node.process_virtual_frame(
            now_ms(),
            self.nwid,
            Mac(src),
            Mac(dst),
            ethertype,
            0,
            &frame[ETHERNET_HEADER_LEN..],
        );
    }
}

/// One tap per joined network.
pub struct VirtualTap {
    pub nwid: NetworkId,
    pub mac: Mac,
    mtu: AtomicUsize,
    netif: NetifId,
    driver: Arc<StackDriver>,
    ips: Mutex<Vec<(IpAddr, u8)>>,
    multicast_groups: Mutex<BTreeSet<MulticastGroup>>,
}

impl VirtualTap {
    /// Create the tap and its netif.
    pub fn new(
        driver: Arc<StackDriver>,
        node: Arc<Node>,
        nwid: NetworkId,
        mac: Mac,
        mtu: usize,
    ) -> Result<Arc<Self>> {
        let netif = driver.add_netif(nwid, mac, mtu, Arc::new(TapTx { nwid, node }))?;
        Ok(Arc::new(Self {
            nwid,
            mac,
            mtu: AtomicUsize::new(mtu),
            netif,
            driver,
            ips: Mutex::new(Vec::new()),
            multicast_groups: Mutex::new(BTreeSet::new()),
        }))
    }

    /// Submit a decrypted inbound frame to the stack.
    pub fn put(&self, src_mac: Mac, dst_mac: Mac, ethertype: u16, data: &[u8]) {
        let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + data.len());
        frame.extend_from_slice(&dst_mac.0);
        frame.extend_from_slice(&src_mac.0);
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(data);
        self.driver.inject_frame(self.netif, frame);
    }

    /// Add an assigned address to the tap and its netif.
    pub fn add_ip(&self, ip: IpAddr, prefix: u8) -> bool {
        let mut ips = self.ips.lock();
        if ips.iter().any(|(a, _)| *a == ip) {
            return false;
        }
        match self.driver.add_ip(self.netif, ip, prefix) {
            Ok(()) => {
                ips.push((ip, prefix));
                debug!(nwid = %self.nwid, %ip, prefix, "tap address added");
                true
            }
            Err(e) => {
                warn!(nwid = %self.nwid, %ip, error = %e, "tap address add failed");
                false
            }
        }
    }

    /// Remove an address from the tap and its netif.
    pub fn remove_ip(&self, ip: IpAddr) -> bool {
        let mut ips = self.ips.lock();
        let before = ips.len();
        ips.retain(|(a, _)| *a != ip);
        if ips.len() == before {
            return false;
        }
        let _ = self.driver.remove_ip(self.netif, ip);
        debug!(nwid = %self.nwid, %ip, "tap address removed");
        true
    }

    /// Current assigned addresses.
    pub fn ips(&self) -> Vec<(IpAddr, u8)> {
        self.ips.lock().clone()
    }

    pub fn has_ipv4(&self) -> bool {
        self.ips.lock().iter().any(|(a, _)| a.is_ipv4())
    }

    pub fn has_ipv6(&self) -> bool {
        self.ips.lock().iter().any(|(a, _)| a.is_ipv6())
    }

    /// Whether the netif's link is up.
    pub fn is_up(&self) -> bool {
        self.driver.netif_is_up(self.netif)
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.mtu.store(mtu, Ordering::Relaxed);
        self.driver.set_mtu(self.netif, mtu);
    }

    pub fn netif_id(&self) -> NetifId {
        self.netif
    }

    /// Install a routed (via-gateway) route on the netif.
    pub fn add_route(&self, via: IpAddr) {
        let _ = self.driver.add_default_route(self.netif, via);
    }

    /// Diff the multicast groups this tap should be subscribed to against
    /// the last scan. The orchestrator forwards the result to the node.
    pub fn scan_multicast_groups(&self) -> (Vec<MulticastGroup>, Vec<MulticastGroup>) {
        let desired = self.desired_groups();
        let mut current = self.multicast_groups.lock();
        let added: Vec<MulticastGroup> = desired.difference(&current).copied().collect();
        let removed: Vec<MulticastGroup> = current.difference(&desired).copied().collect();
        *current = desired;
        (added, removed)
    }

    /// Groups implied by the assigned addresses: the subnet broadcast for
    /// every IPv4 prefix, the solicited-node group for every IPv6
    /// address, and the all-nodes group.
    fn desired_groups(&self) -> BTreeSet<MulticastGroup> {
        let mut groups = BTreeSet::new();
        groups.insert(MulticastGroup::from_ipv6(
            "ff02::1".parse().unwrap_or(std::net::Ipv6Addr::LOCALHOST),
        ));
        for (ip, prefix) in self.ips.lock().iter() {
            match ip {
                IpAddr::V4(v4) => {
                    let bits = u32::from(*v4);
                    let mask = if *prefix >= 32 { u32::MAX } else { !(u32::MAX >> prefix) };
                    let bcast = std::net::Ipv4Addr::from(bits | !mask);
                    groups.insert(MulticastGroup::from_ipv4(bcast));
                }
                IpAddr::V6(v6) => {
                    let o = v6.octets();
                    let solicited: std::net::Ipv6Addr = std::net::Ipv6Addr::new(
                        0xff02,
                        0,
                        0,
                        0,
                        0,
                        1,
                        0xff00 | o[13] as u16,
                        u16::from_be_bytes([o[14], o[15]]),
                    );
                    groups.insert(MulticastGroup::from_ipv6(solicited));
                }
            }
        }
        groups
    }

    /// Tear the netif down.
    pub fn shutdown(&self) {
        self.driver.remove_netif(self.netif);
    }
}
