//! IPv6 neighbor-discovery emulation for deterministic address schemes.
//!
//! RFC 4193 and 6PLANE addresses embed the owner's node address, so a
//! neighbor solicitation never needs to cross the overlay: the answer is
//! computable locally from the target address alone. The node intercepts
//! outbound solicitations whose target decodes to a member of the same
//! network and synthesizes the advertisement, which removes a full
//! multicast round trip from every first contact.

use std::net::Ipv6Addr;

use zerolink_core::{Mac, NetworkId, NodeId};

const IPV6_HEADER_LEN: usize = 40;
const ICMPV6: u8 = 58;
const NEIGHBOR_SOLICITATION: u8 = 135;
const NEIGHBOR_ADVERTISEMENT: u8 = 136;
/// Solicited + override.
const NA_FLAGS: u32 = 0x6000_0000;

/// Decode the node address embedded in an RFC 4193 or 6PLANE address,
/// verifying that the network portion matches `nwid`.
pub fn node_for_target(nwid: NetworkId, target: &Ipv6Addr) -> Option<NodeId> {
    let o = target.octets();
    match o[0] {
        0xfd => {
            // fd + nwid(8) + 99:93 + node(5)
            if o[1..9] != nwid.0.to_be_bytes() || o[9] != 0x99 || o[10] != 0x93 {
                return None;
            }
            Some(node_from_bytes(&o[11..16]))
        }
        0xfc => {
            // fc + folded-nwid(4) + node(5) + zeros + ::1
            let folded = ((nwid.0 >> 32) as u32 ^ nwid.0 as u32).to_be_bytes();
            if o[1..5] != folded {
                return None;
            }
            Some(node_from_bytes(&o[5..10]))
        }
        _ => None,
    }
}

fn node_from_bytes(bytes: &[u8]) -> NodeId {
    let mut v = 0u64;
    for b in bytes {
        v = (v << 8) | *b as u64;
    }
    NodeId::new(v)
}

/// Parse an outbound neighbor solicitation and return its target, or
/// `None` when the packet is anything else. `packet` starts at the IPv6
/// header.
pub fn solicitation_target(packet: &[u8]) -> Option<Ipv6Addr> {
    if packet.len() < IPV6_HEADER_LEN + 24 {
        return None;
    }
    if packet[6] != ICMPV6 || packet[IPV6_HEADER_LEN] != NEIGHBOR_SOLICITATION {
        return None;
    }
    let mut target = [0u8; 16];
    target.copy_from_slice(&packet[IPV6_HEADER_LEN + 8..IPV6_HEADER_LEN + 24]);
    Some(Ipv6Addr::from(target))
}

/// Build the advertisement answering `ns_packet`, claiming `target_mac`
/// as the target's link-layer address.
pub fn synthesize_advertisement(ns_packet: &[u8], target_mac: Mac) -> Option<Vec<u8>> {
    let target = solicitation_target(ns_packet)?;
    let mut src = [0u8; 16];
    src.copy_from_slice(&ns_packet[8..24]);
    // A solicitation from the unspecified address is duplicate detection;
    // answering would falsely report a collision
    if src.iter().all(|b| *b == 0) {
        return None;
    }

    // ICMPv6 payload: NA header (24) + target link-layer option (8)
    let mut icmp = Vec::with_capacity(32);
    icmp.push(NEIGHBOR_ADVERTISEMENT);
    icmp.push(0); // code
    icmp.extend_from_slice(&[0, 0]); // checksum, patched below
    icmp.extend_from_slice(&NA_FLAGS.to_be_bytes());
    icmp.extend_from_slice(&target.octets());
    icmp.push(2); // option: target link-layer address
    icmp.push(1); // length in units of 8 bytes
    icmp.extend_from_slice(&target_mac.0);

    let checksum = icmpv6_checksum(&target.octets(), &src, &icmp);
    icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + icmp.len());
    packet.push(0x60);
    packet.extend_from_slice(&[0, 0, 0]);
    packet.extend_from_slice(&(icmp.len() as u16).to_be_bytes());
    packet.push(ICMPV6);
    packet.push(255); // hop limit required by ND
    packet.extend_from_slice(&target.octets()); // src: the advertised node
    packet.extend_from_slice(&src); // dst: the solicitor
    packet.extend_from_slice(&icmp);
    Some(packet)
}

/// ICMPv6 checksum over the pseudo-header and payload.
fn icmpv6_checksum(src: &[u8; 16], dst: &[u8; 16], payload: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut add_bytes = |bytes: &[u8]| {
        let mut i = 0;
        while i + 1 < bytes.len() {
            sum += u32::from(u16::from_be_bytes([bytes[i], bytes[i + 1]]));
            i += 2;
        }
        if i < bytes.len() {
            sum += u32::from(u16::from_be_bytes([bytes[i], 0]));
        }
    };
    add_bytes(src);
    add_bytes(dst);
    add_bytes(&(payload.len() as u32).to_be_bytes());
    add_bytes(&[0, 0, 0, ICMPV6]);
    add_bytes(payload);
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use zerolink_core::ipv6::{rfc4193_addr, sixplane_addr};

    fn ns_for(src: Ipv6Addr, target: Ipv6Addr) -> Vec<u8> {
        let mut p = vec![0u8; IPV6_HEADER_LEN + 24];
        p[0] = 0x60;
        p[4..6].copy_from_slice(&24u16.to_be_bytes());
        p[6] = ICMPV6;
        p[7] = 255;
        p[8..24].copy_from_slice(&src.octets());
        p[IPV6_HEADER_LEN] = NEIGHBOR_SOLICITATION;
        p[IPV6_HEADER_LEN + 8..IPV6_HEADER_LEN + 24].copy_from_slice(&target.octets());
        p
    }

    #[test]
    fn decodes_both_address_schemes() {
        let nwid = NetworkId::adhoc(8000, 8100);
        let node = NodeId::new(0x9f65ea1234);
        assert_eq!(node_for_target(nwid, &rfc4193_addr(nwid, node)), Some(node));
        assert_eq!(node_for_target(nwid, &sixplane_addr(nwid, node)), Some(node));
        // Wrong network: no match
        let other = NetworkId::adhoc(1, 2);
        assert_eq!(node_for_target(other, &rfc4193_addr(nwid, node)), None);
        // Unrelated address: no match
        assert_eq!(node_for_target(nwid, &"2001:db8::1".parse().unwrap()), None);
    }

    #[test]
    fn advertisement_answers_solicitation() {
        let nwid = NetworkId::adhoc(8000, 8100);
        let asker = NodeId::new(0x1111111111);
        let owner = NodeId::new(0x2222222222);
        let src = rfc4193_addr(nwid, asker);
        let target = rfc4193_addr(nwid, owner);
        let mac = Mac::for_network(owner, nwid);

        let ns = ns_for(src, target);
        assert_eq!(solicitation_target(&ns), Some(target));
        let na = synthesize_advertisement(&ns, mac).unwrap();

        // Header swaps the parties
        assert_eq!(&na[8..24], &target.octets());
        assert_eq!(&na[24..40], &src.octets());
        assert_eq!(na[IPV6_HEADER_LEN], NEIGHBOR_ADVERTISEMENT);
        // Target and its MAC are advertised
        assert_eq!(&na[IPV6_HEADER_LEN + 8..IPV6_HEADER_LEN + 24], &target.octets());
        assert_eq!(&na[IPV6_HEADER_LEN + 26..IPV6_HEADER_LEN + 32], &mac.0);
        // Checksum verifies to zero when recomputed over the wire form
        let sum = icmpv6_checksum(
            &target.octets(),
            &src.octets(),
            &na[IPV6_HEADER_LEN..],
        );
        assert_eq!(sum, 0);
    }

    #[test]
    fn duplicate_address_detection_is_left_alone() {
        let nwid = NetworkId::adhoc(8000, 8100);
        let owner = NodeId::new(0x2222222222);
        let ns = ns_for(Ipv6Addr::UNSPECIFIED, rfc4193_addr(nwid, owner));
        assert!(synthesize_advertisement(&ns, Mac::for_network(owner, nwid)).is_none());
    }

    #[test]
    fn non_solicitations_are_ignored() {
        assert!(solicitation_target(&[0u8; 80]).is_none());
        assert!(solicitation_target(&[0u8; 10]).is_none());
    }
}
