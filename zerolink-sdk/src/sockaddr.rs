//! Packed socket-address encoding for wrapper parity.
//!
//! Language bindings marshal addresses as flat byte buffers rather than
//! native structs. The layout here is this library's own stable contract
//! (family as little-endian u16, port big-endian, then the address), and
//! the classic length window applies: anything shorter than an IPv4
//! entry or longer than the storage size is a structural argument error.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use zerolink_stack::{AF_INET, AF_INET6};

/// Packed IPv4 entry: family(2) + port(2) + addr(4) + zero padding.
pub const SOCKADDR_IN_LEN: usize = 16;
/// Packed IPv6 entry: family(2) + port(2) + flowinfo(4) + addr(16) + scope(4).
pub const SOCKADDR_IN6_LEN: usize = 28;
/// Largest accepted buffer.
pub const SOCKADDR_STORAGE_LEN: usize = 128;

/// Encode an address into the packed layout.
pub fn encode(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = vec![0u8; SOCKADDR_IN_LEN];
            out[0..2].copy_from_slice(&(AF_INET as u16).to_le_bytes());
            out[2..4].copy_from_slice(&v4.port().to_be_bytes());
            out[4..8].copy_from_slice(&v4.ip().octets());
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = vec![0u8; SOCKADDR_IN6_LEN];
            out[0..2].copy_from_slice(&(AF_INET6 as u16).to_le_bytes());
            out[2..4].copy_from_slice(&v6.port().to_be_bytes());
            out[4..8].copy_from_slice(&v6.flowinfo().to_be_bytes());
            out[8..24].copy_from_slice(&v6.ip().octets());
            out[24..28].copy_from_slice(&v6.scope_id().to_be_bytes());
            out
        }
    }
}

/// Decode a packed address, applying the length window checks.
pub fn decode(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() < SOCKADDR_IN_LEN || bytes.len() > SOCKADDR_STORAGE_LEN {
        return None;
    }
    let family = u16::from_le_bytes([bytes[0], bytes[1]]) as i32;
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    match family {
        f if f == AF_INET => {
            let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        f if f == AF_INET6 => {
            if bytes.len() < SOCKADDR_IN6_LEN {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[8..24]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr: SocketAddr = "10.7.0.2:8442".parse().unwrap();
        let bytes = encode(&addr);
        assert_eq!(bytes.len(), SOCKADDR_IN_LEN);
        assert_eq!(decode(&bytes).unwrap(), addr);
    }

    #[test]
    fn v6_round_trip() {
        let addr: SocketAddr = "[fd00:abcd::1]:9993".parse().unwrap();
        let bytes = encode(&addr);
        assert_eq!(bytes.len(), SOCKADDR_IN6_LEN);
        assert_eq!(decode(&bytes).unwrap(), addr);
    }

    #[test]
    fn length_window_is_enforced() {
        let addr: SocketAddr = "10.7.0.2:1".parse().unwrap();
        let bytes = encode(&addr);
        assert!(decode(&bytes[..SOCKADDR_IN_LEN - 1]).is_none());
        assert!(decode(&vec![0u8; SOCKADDR_STORAGE_LEN + 1]).is_none());
        // Padded to storage size still decodes
        let mut padded = bytes.clone();
        padded.resize(SOCKADDR_STORAGE_LEN, 0);
        assert_eq!(decode(&padded).unwrap(), addr);
    }

    #[test]
    fn unknown_family_is_refused() {
        let mut bytes = vec![0u8; SOCKADDR_IN_LEN];
        bytes[0] = 77;
        assert!(decode(&bytes).is_none());
    }
}
