//! Deterministic IPv6 address derivations.
//!
//! Both schemes map `(network, node)` to an address with no coordination:
//! every member computes every other member's address locally. RFC 4193
//! yields one /128 inside a ULA /88; 6PLANE yields a /80 per node inside a
//! /40, leaving room for each node to route a further 2^48 addresses.

use crate::types::{NetworkId, NodeId};
use std::net::Ipv6Addr;

/// RFC 4193 unique-local address for a node on a network.
///
/// Layout: `fd` | nwid (8 bytes) | `99:93` | node (5 bytes).
pub fn rfc4193_addr(nwid: NetworkId, node: NodeId) -> Ipv6Addr {
    let nw = nwid.0.to_be_bytes();
    let nd = node.0.to_be_bytes();
    Ipv6Addr::from([
        0xfd, nw[0], nw[1], nw[2], nw[3], nw[4], nw[5], nw[6], nw[7], 0x99, 0x93, nd[3], nd[4],
        nd[5], nd[6], nd[7],
    ])
}

/// The prefix length of an RFC 4193 assignment.
pub const RFC4193_PREFIX_LEN: u8 = 88;

/// 6PLANE address for a node on a network.
///
/// The 64-bit network ID is folded to 32 bits by XORing its halves, giving
/// layout `fc` | folded nwid (4 bytes) | node (5 bytes) | zeros | `01`.
pub fn sixplane_addr(nwid: NetworkId, node: NodeId) -> Ipv6Addr {
    let folded = ((nwid.0 >> 32) as u32 ^ nwid.0 as u32).to_be_bytes();
    let nd = node.0.to_be_bytes();
    Ipv6Addr::from([
        0xfc, folded[0], folded[1], folded[2], folded[3], nd[3], nd[4], nd[5], nd[6], nd[7], 0x00,
        0x00, 0x00, 0x00, 0x00, 0x01,
    ])
}

/// The per-node prefix length of a 6PLANE assignment.
pub const SIXPLANE_PREFIX_LEN: u8 = 80;
