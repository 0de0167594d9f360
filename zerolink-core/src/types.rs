#![cfg_attr(test, allow(clippy::unwrap_used))]

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

/// 64-bit identifier of a virtual L2 network.
///
/// Rendered as 16 lowercase hex digits. IDs of the form
/// `0xff SSSS EEEE 00000000` denote controllerless ad-hoc networks that
/// admit only IPv6 unicast UDP and TCP whose destination port falls in the
/// inclusive range `[SSSS, EEEE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub u64);

impl NetworkId {
    /// Build an ad-hoc network ID admitting the given inclusive port range.
    pub fn adhoc(start_port: u16, end_port: u16) -> Self {
        Self(0xff00_0000_0000_0000 | ((start_port as u64) << 40) | ((end_port as u64) << 24))
    }

    /// Decode the ad-hoc port range, or `None` for controller-backed IDs.
    pub fn adhoc_port_range(self) -> Option<(u16, u16)> {
        if self.0 >> 56 == 0xff {
            Some((((self.0 >> 40) & 0xffff) as u16, ((self.0 >> 24) & 0xffff) as u16))
        } else {
            None
        }
    }

    /// The node that acts as controller for this network (top 40 bits).
    ///
    /// Meaningless for ad-hoc IDs; callers must check [`Self::adhoc_port_range`]
    /// first.
    pub fn controller(self) -> NodeId {
        NodeId(self.0 >> 24)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Self)
    }
}

impl From<u64> for NetworkId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// 40-bit overlay address of a node, derived from its identity keypair.
///
/// Rendered as 10 lowercase hex digits. The upper 24 bits of the inner
/// `u64` are always zero and addresses beginning with `0xff` are reserved
/// and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Address prefix reserved for internal use; identities never derive it.
    pub const RESERVED_PREFIX: u8 = 0xff;

    /// Construct from a 40-bit value, masking any stray upper bits.
    pub fn new(v: u64) -> Self {
        Self(v & 0xff_ffff_ffff)
    }

    /// True when the address falls in a range valid for allocation.
    pub fn is_valid(self) -> bool {
        self.0 != 0 && (self.0 >> 32) as u8 != Self::RESERVED_PREFIX && self.0 <= 0xff_ffff_ffff
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Self::new)
    }
}

/// 48-bit virtual MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// The Ethernet broadcast address.
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    /// Derive the MAC a node uses on a given network.
    ///
    /// Deterministic across processes: both ends of a link compute the same
    /// mapping, so no address-learning protocol runs over the overlay. The
    /// first octet is locally administered, unicast, and remapped away from
    /// `0x52` to avoid a pattern some hypervisors claim for themselves.
    pub fn for_network(node: NodeId, nwid: NetworkId) -> Self {
        let nw = nwid.0;
        let mut first = (nw & 0xfe) as u8 | 0x02;
        if first == 0x52 {
            first = 0x32;
        }
        let mut m = ((first as u64) << 40) | node.0;
        m ^= ((nw >> 8) & 0xff) << 32;
        m ^= ((nw >> 16) & 0xff) << 24;
        m ^= ((nw >> 24) & 0xff) << 16;
        m ^= ((nw >> 32) & 0xff) << 8;
        m ^= (nw >> 40) & 0xff;
        Self::from_u64(m)
    }

    /// Invert [`Self::for_network`] to recover the node behind a MAC.
    pub fn to_node(self, nwid: NetworkId) -> NodeId {
        let nw = nwid.0;
        let mut m = self.as_u64();
        m ^= ((nw >> 8) & 0xff) << 32;
        m ^= ((nw >> 16) & 0xff) << 24;
        m ^= ((nw >> 24) & 0xff) << 16;
        m ^= ((nw >> 32) & 0xff) << 8;
        m ^= (nw >> 40) & 0xff;
        NodeId::new(m)
    }

    /// True for group (multicast/broadcast) addresses.
    pub fn is_multicast(self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn as_u64(self) -> u64 {
        let b = self.0;
        ((b[0] as u64) << 40)
            | ((b[1] as u64) << 32)
            | ((b[2] as u64) << 24)
            | ((b[3] as u64) << 16)
            | ((b[4] as u64) << 8)
            | b[5] as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self([
            (v >> 40) as u8,
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ])
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Reachability class of an IP address, used by the binder's admission
/// filter and by path checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InetScope {
    Loopback,
    LinkLocal,
    Multicast,
    Private,
    /// RFC 6598 carrier-grade shared space (100.64.0.0/10).
    Shared,
    Global,
}

/// Classify an IP address into a reachability scope.
pub fn scope_of(ip: &IpAddr) -> InetScope {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                InetScope::Loopback
            } else if v4.is_link_local() {
                InetScope::LinkLocal
            } else if v4.is_multicast() {
                InetScope::Multicast
            } else if v4.is_private() {
                InetScope::Private
            } else if in_shared_space(*v4) {
                InetScope::Shared
            } else {
                InetScope::Global
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                InetScope::Loopback
            } else if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                InetScope::LinkLocal
            } else if v6.is_multicast() {
                InetScope::Multicast
            } else if (v6.segments()[0] & 0xfe00) == 0xfc00 {
                InetScope::Private
            } else {
                InetScope::Global
            }
        }
    }
}

fn in_shared_space(v4: Ipv4Addr) -> bool {
    let o = v4.octets();
    o[0] == 100 && (o[1] & 0xc0) == 64
}

/// True when `ip` falls inside `cidr` = (network address, prefix length).
pub fn cidr_contains(cidr: (IpAddr, u8), ip: &IpAddr) -> bool {
    match (cidr.0, ip) {
        (IpAddr::V4(net), IpAddr::V4(a)) => {
            let bits = cidr.1.min(32) as u32;
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            (u32::from(net) & mask) == (u32::from(*a) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(a)) => {
            let bits = cidr.1.min(128) as u32;
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            (u128::from(net) & mask) == (u128::from(*a) & mask)
        }
        _ => false,
    }
}

/// A route pushed by a network controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtRoute {
    /// Target prefix.
    pub target: IpAddr,
    /// Prefix length of `target`.
    pub prefix_len: u8,
    /// Next hop, or `None` for an on-link route.
    pub via: Option<IpAddr>,
    pub flags: u16,
    pub metric: u16,
}

/// An Ethernet multicast subscription: group MAC plus additional
/// distinguishing information (the IPv4 broadcast address for ARP-style
/// groups, zero otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MulticastGroup {
    pub mac: Mac,
    pub adi: u32,
}

impl MulticastGroup {
    /// The group an IPv4 multicast or broadcast address maps to.
    pub fn from_ipv4(ip: Ipv4Addr) -> Self {
        let o = ip.octets();
        if ip.is_broadcast() || o[3] == 0xff {
            // ARP-style broadcast group, distinguished by the address itself
            Self { mac: Mac::BROADCAST, adi: u32::from(ip) }
        } else {
            Self {
                mac: Mac([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]),
                adi: 0,
            }
        }
    }

    /// The group an IPv6 multicast address maps to.
    pub fn from_ipv6(ip: Ipv6Addr) -> Self {
        let o = ip.octets();
        Self {
            mac: Mac([0x33, 0x33, o[12], o[13], o[14], o[15]]),
            adi: 0,
        }
    }
}

/// Membership status of a joined network as last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    RequestingConfig,
    Ok,
    AccessDenied,
    NotFound,
    PortError,
    ClientTooOld,
}

/// Snapshot of one network membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub nwid: NetworkId,
    pub mac: Mac,
    pub name: String,
    pub status: NetworkStatus,
    pub mtu: usize,
    /// Controller-assigned addresses with their prefix lengths.
    pub assigned_addrs: Vec<(IpAddr, u8)>,
    pub routes: Vec<VirtRoute>,
    /// True when the network bridges to other L2 segments (frames may
    /// carry MACs that do not map back to a member node).
    pub bridging_allowed: bool,
}

impl NetworkInfo {
    pub fn has_ipv4(&self) -> bool {
        self.assigned_addrs.iter().any(|(a, _)| a.is_ipv4())
    }

    pub fn has_ipv6(&self) -> bool {
        self.assigned_addrs.iter().any(|(a, _)| a.is_ipv6())
    }
}

/// Role a peer plays in the overlay topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Leaf,
    Moon,
    Planet,
}

/// One concrete way of reaching a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    pub endpoint: SocketAddr,
    /// Milliseconds since epoch of the last transmit on this path.
    pub last_send: i64,
    /// Milliseconds since epoch of the last receive on this path.
    pub last_receive: i64,
    /// Non-zero when the path is on a trusted physical segment.
    pub trusted_path_id: u64,
    pub expired: bool,
    pub preferred: bool,
}

/// Snapshot of one peer. Paths keep a stable order within a snapshot:
/// preferred first, then most recently heard from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: NodeId,
    /// Remote version as (major, minor, revision), or `None` when unknown.
    pub version: Option<(u16, u16, u16)>,
    /// Last measured one-way latency in milliseconds, or -1 when unknown.
    pub latency: i32,
    pub role: PeerRole,
    pub paths: Vec<PathInfo>,
}
