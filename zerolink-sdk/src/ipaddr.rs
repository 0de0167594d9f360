//! Presentation-form address helpers.
//!
//! The classic pton/ntop pair, plus a permissive parse that accepts
//! either family. Canonical forms survive the round trip unchanged
//! (lowercase, shortest-form IPv6).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use zerolink_stack::{AF_INET, AF_INET6};

/// Parse presentation form into raw network-order bytes. Returns 1 on
/// success, 0 on a malformed address, matching the classic tristate.
pub fn inet_pton(family: i32, src: &str, dst: &mut [u8]) -> i32 {
    match family {
        f if f == AF_INET => match Ipv4Addr::from_str(src) {
            Ok(ip) if dst.len() >= 4 => {
                dst[..4].copy_from_slice(&ip.octets());
                1
            }
            _ => 0,
        },
        f if f == AF_INET6 => match Ipv6Addr::from_str(src) {
            Ok(ip) if dst.len() >= 16 => {
                dst[..16].copy_from_slice(&ip.octets());
                1
            }
            _ => 0,
        },
        _ => -1,
    }
}

/// Render raw network-order bytes in presentation form.
pub fn inet_ntop(family: i32, src: &[u8]) -> Option<String> {
    match family {
        f if f == AF_INET => {
            let octets: [u8; 4] = src.get(..4)?.try_into().ok()?;
            Some(Ipv4Addr::from(octets).to_string())
        }
        f if f == AF_INET6 => {
            let octets: [u8; 16] = src.get(..16)?.try_into().ok()?;
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Family-agnostic parse.
pub fn ipaddr_aton(src: &str) -> Option<IpAddr> {
    IpAddr::from_str(src).ok()
}

/// Family-agnostic render.
pub fn ipaddr_ntoa(addr: &IpAddr) -> String {
    addr.to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pton_ntop_round_trips_canonical_forms() {
        let mut buf = [0u8; 16];
        assert_eq!(inet_pton(AF_INET, "192.168.22.2", &mut buf), 1);
        assert_eq!(inet_ntop(AF_INET, &buf).unwrap(), "192.168.22.2");

        assert_eq!(inet_pton(AF_INET6, "fd00:abcd::1", &mut buf), 1);
        assert_eq!(inet_ntop(AF_INET6, &buf).unwrap(), "fd00:abcd::1");
    }

    #[test]
    fn malformed_input_is_reported() {
        let mut buf = [0u8; 16];
        assert_eq!(inet_pton(AF_INET, "256.1.1.1", &mut buf), 0);
        assert_eq!(inet_pton(AF_INET, "not an address", &mut buf), 0);
        assert_eq!(inet_pton(99, "1.2.3.4", &mut buf), -1);
        assert!(inet_ntop(AF_INET, &[1, 2]).is_none());
    }

    #[test]
    fn aton_ntoa_round_trips() {
        for s in ["192.168.22.2", "10.0.0.1", "fd00::1", "fc00:1:2:3::1"] {
            let parsed = ipaddr_aton(s).unwrap();
            assert_eq!(ipaddr_ntoa(&parsed), s);
        }
        assert!(ipaddr_aton("churlish").is_none());
    }

    proptest! {
        #[test]
        fn pton_ntop_identity_for_arbitrary_v4(a: u8, b: u8, c: u8, d: u8) {
            let text = format!("{a}.{b}.{c}.{d}");
            let mut buf = [0u8; 4];
            prop_assert_eq!(inet_pton(AF_INET, &text, &mut buf), 1);
            prop_assert_eq!(inet_ntop(AF_INET, &buf).unwrap(), text);
        }

        #[test]
        fn ntop_pton_identity_for_arbitrary_v6(octets: [u8; 16]) {
            let text = inet_ntop(AF_INET6, &octets).unwrap();
            let mut buf = [0u8; 16];
            prop_assert_eq!(inet_pton(AF_INET6, &text, &mut buf), 1);
            prop_assert_eq!(buf, octets);
        }
    }
}
