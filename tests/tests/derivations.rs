//! Pure-function contracts: identity blobs, deterministic addressing,
//! ad-hoc network IDs, and the stability of public numbering.

use zerolink_core::ipv6::{rfc4193_addr, sixplane_addr, RFC4193_PREFIX_LEN, SIXPLANE_PREFIX_LEN};
use zerolink_core::{Event, Mac, NetworkId, NodeId, ReturnCode};
use zerolink_sdk::id::{id_address, id_new, id_pair_is_valid};
use zerolink_sdk::ipaddr::{inet_ntop, inet_pton, ipaddr_aton, ipaddr_ntoa};
use zerolink_sdk::{AF_INET, AF_INET6};

#[test]
fn identity_generation_and_bit_flips() {
    let blob = id_new();
    assert!(id_pair_is_valid(&blob));
    let address = id_address(&blob).expect("address");
    assert!(address.is_valid());

    // Flipping any single hex digit invalidates the pair
    let colon = blob.find(':').expect("colon");
    for i in [0, colon + 3, blob.len() - 1] {
        let mut chars: Vec<char> = blob.chars().collect();
        chars[i] = if chars[i] == 'f' { 'e' } else { 'f' };
        let corrupted: String = chars.into_iter().collect();
        if corrupted != blob {
            assert!(!id_pair_is_valid(&corrupted), "flip at {i}");
        }
    }

    // Distinct generations yield distinct addresses
    let other = id_new();
    assert_ne!(id_address(&other), Some(address));
}

#[test]
fn deterministic_ipv6_layouts() {
    let nwid: NetworkId = "8056c2e21c000001".parse().expect("nwid");
    let node: NodeId = "9f65ea1234".parse().expect("node");

    let ula = rfc4193_addr(nwid, node);
    let o = ula.octets();
    assert_eq!(o[0], 0xfd);
    assert_eq!(&o[1..9], &nwid.0.to_be_bytes());
    assert_eq!((o[9], o[10]), (0x99, 0x93));
    assert_eq!(&o[11..], &[0x9f, 0x65, 0xea, 0x12, 0x34]);
    assert_eq!(RFC4193_PREFIX_LEN, 88);

    let plane = sixplane_addr(nwid, node);
    let o = plane.octets();
    assert_eq!(o[0], 0xfc);
    assert_eq!(&o[1..5], &(0x8056c2e2u32 ^ 0x1c000001u32).to_be_bytes());
    assert_eq!(&o[5..10], &[0x9f, 0x65, 0xea, 0x12, 0x34]);
    assert_eq!(o[15], 0x01);
    assert_eq!(SIXPLANE_PREFIX_LEN, 80);

    // Both are stateless: same inputs, same outputs
    assert_eq!(ula, rfc4193_addr(nwid, node));
    assert_eq!(plane, sixplane_addr(nwid, node));
}

#[test]
fn adhoc_network_id_form() {
    let nwid = NetworkId::adhoc(0x2710, 0x4e20);
    assert_eq!(nwid.0 >> 56, 0xff);
    assert_eq!(nwid.adhoc_port_range(), Some((10000, 20000)));
    assert!(NetworkId(0x8056c2e21c000001).adhoc_port_range().is_none());
}

#[test]
fn mac_derivation_round_trip() {
    let nwid = NetworkId::adhoc(8000, 8000);
    for raw in [0x1u64, 0x9f65ea1234, 0xff_ffff_fffe] {
        let node = NodeId::new(raw);
        let mac = Mac::for_network(node, nwid);
        assert_eq!(mac.to_node(nwid), node);
        assert!(!mac.is_multicast());
    }
}

#[test]
fn presentation_round_trips() {
    let mut buf = [0u8; 16];
    assert_eq!(inet_pton(AF_INET, "192.168.22.2", &mut buf), 1);
    assert_eq!(inet_ntop(AF_INET, &buf).as_deref(), Some("192.168.22.2"));
    assert_eq!(inet_pton(AF_INET6, "fd00:11:22::1", &mut buf), 1);
    assert_eq!(inet_ntop(AF_INET6, &buf).as_deref(), Some("fd00:11:22::1"));

    let ip = ipaddr_aton("10.7.0.2").expect("parse");
    assert_eq!(ipaddr_ntoa(&ip), "10.7.0.2");
}

#[test]
fn public_numbering_is_frozen() {
    // Applications match on these numbers across versions and language
    // wrappers; any change here is a compatibility break.
    assert_eq!(ReturnCode::Ok as i32, 0);
    assert_eq!(ReturnCode::Socket as i32, -1);
    assert_eq!(ReturnCode::Service as i32, -2);
    assert_eq!(ReturnCode::Arg as i32, -3);
    assert_eq!(ReturnCode::NoResult as i32, -4);
    assert_eq!(ReturnCode::General as i32, -5);

    assert_eq!(Event::NodeUp as i32, 200);
    assert_eq!(Event::NodeOnline as i32, 201);
    assert_eq!(Event::NodeOffline as i32, 202);
    assert_eq!(Event::NodeDown as i32, 203);
    assert_eq!(Event::NodeFatalError as i32, 204);
    assert_eq!(Event::NetworkNotFound as i32, 210);
    assert_eq!(Event::NetworkClientTooOld as i32, 211);
    assert_eq!(Event::NetworkRequestingConfig as i32, 212);
    assert_eq!(Event::NetworkOk as i32, 213);
    assert_eq!(Event::NetworkAccessDenied as i32, 214);
    assert_eq!(Event::NetworkReadyIp4 as i32, 215);
    assert_eq!(Event::NetworkReadyIp6 as i32, 216);
    assert_eq!(Event::NetworkReadyIp4Ip6 as i32, 217);
    assert_eq!(Event::NetworkDown as i32, 218);
    assert_eq!(Event::NetworkUpdate as i32, 219);
    assert_eq!(Event::StackUp as i32, 220);
    assert_eq!(Event::StackDown as i32, 221);
    assert_eq!(Event::NetifUp as i32, 230);
    assert_eq!(Event::NetifDown as i32, 231);
    assert_eq!(Event::NetifRemoved as i32, 232);
    assert_eq!(Event::NetifLinkUp as i32, 233);
    assert_eq!(Event::NetifLinkDown as i32, 234);
    assert_eq!(Event::PeerDirect as i32, 240);
    assert_eq!(Event::PeerRelay as i32, 241);
    assert_eq!(Event::PeerUnreachable as i32, 242);
    assert_eq!(Event::PeerPathDiscovered as i32, 243);
    assert_eq!(Event::PeerPathDead as i32, 244);
    assert_eq!(Event::RouteAdded as i32, 250);
    assert_eq!(Event::RouteRemoved as i32, 251);
    assert_eq!(Event::AddrAddedIp4 as i32, 260);
    assert_eq!(Event::AddrRemovedIp4 as i32, 261);
    assert_eq!(Event::AddrAddedIp6 as i32, 262);
    assert_eq!(Event::AddrRemovedIp6 as i32, 263);
    assert_eq!(Event::StoreIdentitySecret as i32, 270);
    assert_eq!(Event::StoreIdentityPublic as i32, 271);
    assert_eq!(Event::StorePlanet as i32, 272);
    assert_eq!(Event::StorePeer as i32, 273);
    assert_eq!(Event::StoreNetwork as i32, 274);
}
