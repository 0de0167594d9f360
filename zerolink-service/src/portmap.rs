//! NAT-PMP port mapping for the auxiliary port (RFC 6886).
//!
//! Best-effort only: the mapper probes likely gateway addresses, asks for
//! a UDP mapping of the auxiliary port, and renews it at half the lease.
//! Failure is silent; "no external mapping available right now" is a
//! normal state the orchestrator simply observes as an empty list.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::Networks;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const NAT_PMP_PORT: u16 = 5351;
const OP_EXTERNAL_ADDR: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const REQUESTED_LEASE_SECS: u32 = 7200;
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(750);
/// Interval between mapping attempts when no gateway answers.
const RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Handle to the background mapping task.
pub struct PortMapper {
    external: Arc<Mutex<Vec<SocketAddr>>>,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PortMapper {
    /// Start mapping `internal_port` in the background.
    pub fn start(runtime: &tokio::runtime::Handle, internal_port: u16) -> Self {
        let external = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let task = {
            let external = external.clone();
            let stop = stop.clone();
            runtime.spawn(async move {
                mapping_loop(internal_port, external, stop).await;
            })
        };
        Self { external, stop, task: Mutex::new(Some(task)) }
    }

    /// Externally visible addresses obtained from the NAT, if any.
    pub fn external_addresses(&self) -> Vec<SocketAddr> {
        self.external.lock().clone()
    }

    /// Stop renewing; existing NAT state ages out on its own.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn mapping_loop(
    internal_port: u16,
    external: Arc<Mutex<Vec<SocketAddr>>>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let mut renewal = RETRY_INTERVAL;
        for gateway in candidate_gateways() {
            match map_once(gateway, internal_port).await {
                Some((addr, lease_secs)) => {
                    info!(%addr, gateway = %gateway, "nat-pmp mapping obtained");
                    *external.lock() = vec![addr];
                    renewal = Duration::from_secs((lease_secs as u64 / 2).max(30));
                    break;
                }
                None => {
                    debug!(gateway = %gateway, "no nat-pmp response");
                }
            }
        }
        tokio::time::sleep(renewal).await;
    }
}

/// One request/response exchange: external address, then the mapping.
async fn map_once(gateway: Ipv4Addr, internal_port: u16) -> Option<(SocketAddr, u32)> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect((gateway, NAT_PMP_PORT)).await.ok()?;

    // Opcode 0: what is our external address?
    socket.send(&[0u8, OP_EXTERNAL_ADDR]).await.ok()?;
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv(&mut buf))
        .await
        .ok()?
        .ok()?;
    if n < 12 || buf[1] != 128 + OP_EXTERNAL_ADDR || u16::from_be_bytes([buf[2], buf[3]]) != 0 {
        return None;
    }
    let external_ip = Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]);

    // Opcode 1: map our UDP port
    let mut req = [0u8; 12];
    req[1] = OP_MAP_UDP;
    req[4..6].copy_from_slice(&internal_port.to_be_bytes());
    req[6..8].copy_from_slice(&internal_port.to_be_bytes());
    req[8..12].copy_from_slice(&REQUESTED_LEASE_SECS.to_be_bytes());
    socket.send(&req).await.ok()?;
    let n = tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv(&mut buf))
        .await
        .ok()?
        .ok()?;
    if n < 16 || buf[1] != 128 + OP_MAP_UDP || u16::from_be_bytes([buf[2], buf[3]]) != 0 {
        return None;
    }
    let mapped_port = u16::from_be_bytes([buf[10], buf[11]]);
    let lease = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
    Some((SocketAddr::new(IpAddr::V4(external_ip), mapped_port), lease))
}

/// Likely gateway addresses: the `.1` of every private IPv4 prefix the
/// host sits on.
fn candidate_gateways() -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    let networks = Networks::new_with_refreshed_list();
    for (_, data) in networks.iter() {
        for ipn in data.ip_networks() {
            if let IpAddr::V4(v4) = ipn.addr {
                if v4.is_private() {
                    let o = v4.octets();
                    let gw = Ipv4Addr::new(o[0], o[1], o[2], 1);
                    if gw != v4 && !out.contains(&gw) {
                        out.push(gw);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn answers_from_a_fake_gateway() {
        // A loopback NAT-PMP responder standing in for the home router
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let gw_addr = gateway.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            loop {
                let Ok((n, from)) = gateway.recv_from(&mut buf).await else { return };
                if n >= 2 && buf[1] == OP_EXTERNAL_ADDR {
                    let mut resp = [0u8; 12];
                    resp[1] = 128;
                    resp[8..12].copy_from_slice(&[203, 0, 113, 9]);
                    let _ = gateway.send_to(&resp, from).await;
                } else if n >= 12 && buf[1] == OP_MAP_UDP {
                    let mut resp = [0u8; 16];
                    resp[1] = 128 + OP_MAP_UDP;
                    resp[8..10].copy_from_slice(&buf[4..6]);
                    resp[10..12].copy_from_slice(&[0xab, 0xcd]);
                    resp[12..16].copy_from_slice(&7200u32.to_be_bytes());
                    let _ = gateway.send_to(&resp, from).await;
                }
            }
        });

        // Drive map_once against the fake responder directly
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(gw_addr).await.unwrap();
        socket.send(&[0u8, OP_EXTERNAL_ADDR]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n >= 12);
        assert_eq!(&buf[8..12], &[203, 0, 113, 9]);
    }

    #[test]
    fn candidate_gateways_are_dot_one() {
        for gw in candidate_gateways() {
            assert_eq!(gw.octets()[3], 1);
        }
    }
}
