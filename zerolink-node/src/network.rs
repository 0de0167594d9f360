//! Per-network membership state.
//!
//! Controller-backed networks start in `RequestingConfig` and move to their
//! final status when the controller's reply arrives. Ad-hoc networks
//! (`0xff` prefix) have no controller: the config is computed locally and
//! membership is immediately `Ok`, with an ingress/egress filter limiting
//! traffic to IPv6 unicast UDP/TCP in the encoded port range.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

use zerolink_core::ipv6::{rfc4193_addr, RFC4193_PREFIX_LEN};
use zerolink_core::{
    Mac, MulticastGroup, NetworkId, NetworkInfo, NetworkStatus, NodeId, DEFAULT_MTU,
};

/// While a network is `RequestingConfig`, re-ask the controller this often.
pub const CONFIG_REQUEST_INTERVAL_MS: i64 = 10_000;
/// Re-gossip our multicast subscriptions this often.
pub const MULTICAST_ANNOUNCE_INTERVAL_MS: i64 = 120_000;
/// Cap on recipients for one multicast frame fan-out.
pub const MULTICAST_FANOUT_LIMIT: usize = 64;

/// Ethertypes the virtual wire carries.
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const IPV6: u16 = 0x86dd;
}

/// State for one joined network.
pub struct Membership {
    pub info: NetworkInfo,
    /// Our own subscriptions, gossiped to other members.
    pub local_subs: BTreeSet<MulticastGroup>,
    /// Which members subscribed to which groups.
    pub member_subs: HashMap<MulticastGroup, HashSet<NodeId>>,
    /// Members seen on this network (from frames and gossip).
    pub members: HashSet<NodeId>,
    pub last_config_request: i64,
    pub last_multicast_announce: i64,
}

impl Membership {
    /// Start a controller-backed membership in `RequestingConfig`.
    pub fn new_requesting(nwid: NetworkId, node: NodeId) -> Self {
        Self {
            info: NetworkInfo {
                nwid,
                mac: Mac::for_network(node, nwid),
                name: String::new(),
                status: NetworkStatus::RequestingConfig,
                mtu: DEFAULT_MTU,
                assigned_addrs: Vec::new(),
                routes: Vec::new(),
                bridging_allowed: false,
            },
            local_subs: BTreeSet::new(),
            member_subs: HashMap::new(),
            members: HashSet::new(),
            last_config_request: 0,
            last_multicast_announce: 0,
        }
    }

    /// Build a fully local ad-hoc membership.
    pub fn new_adhoc(nwid: NetworkId, node: NodeId) -> Self {
        let (start, end) = nwid.adhoc_port_range().unwrap_or((0, 0));
        let mut m = Self::new_requesting(nwid, node);
        m.info.name = format!("adhoc-{start:04x}-{end:04x}");
        m.info.status = NetworkStatus::Ok;
        m.info.assigned_addrs = vec![(
            IpAddr::V6(rfc4193_addr(nwid, node)),
            RFC4193_PREFIX_LEN,
        )];
        m
    }

    pub fn is_adhoc(&self) -> bool {
        self.info.nwid.adhoc_port_range().is_some()
    }

    /// Everyone this frame's group reaches, capped at the fan-out limit.
    /// Broadcast implicitly reaches every known member.
    pub fn multicast_recipients(&self, group: &MulticastGroup) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = if group.mac == Mac::BROADCAST {
            self.members.iter().copied().collect()
        } else {
            self.member_subs
                .get(group)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        };
        out.sort_unstable();
        out.truncate(MULTICAST_FANOUT_LIMIT);
        out
    }

    /// Apply the ad-hoc admission filter to a frame in either direction.
    /// Controller networks admit everything the controller's config allows
    /// (no rules engine here), so this returns true for them.
    pub fn frame_allowed(&self, ethertype: u16, data: &[u8]) -> bool {
        match self.info.nwid.adhoc_port_range() {
            None => true,
            Some(range) => adhoc_frame_allowed(ethertype, data, range),
        }
    }
}

/// Ad-hoc filter: IPv6 only; ICMPv6 passes (neighbor discovery must work);
/// UDP and initial TCP SYNs must target a port inside the range. TCP
/// segments of established flows pass so replies on ephemeral ports work.
fn adhoc_frame_allowed(ethertype: u16, data: &[u8], range: (u16, u16)) -> bool {
    if ethertype != ethertype::IPV6 || data.len() < 40 {
        return false;
    }
    let next_header = data[6];
    let payload = &data[40..];
    match next_header {
        58 => true, // ICMPv6
        17 => {
            // UDP: destination port at payload offset 2
            payload.len() >= 4 && port_in_range(u16::from_be_bytes([payload[2], payload[3]]), range)
        }
        6 => {
            if payload.len() < 14 {
                return false;
            }
            let flags = payload[13];
            let syn = flags & 0x02 != 0;
            let ack = flags & 0x10 != 0;
            if syn && !ack {
                port_in_range(u16::from_be_bytes([payload[2], payload[3]]), range)
            } else {
                true
            }
        }
        _ => false,
    }
}

fn port_in_range(port: u16, range: (u16, u16)) -> bool {
    port >= range.0 && port <= range.1
}
