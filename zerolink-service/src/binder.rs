//! UDP binder: one socket per usable (interface address, port) pair.
//!
//! Host interfaces come and go; `refresh` reconciles the bound set
//! against the current enumeration, closing sockets whose address has
//! disappeared and opening sockets for new ones. Every bound socket runs
//! a receive task that feeds datagrams to the wire-packet handler.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use sysinfo::Networks;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zerolink_core::{cidr_contains, scope_of, InetScope, ServiceConfig};
use zerolink_node::LocalSocket;

/// Receive-side consumer of wire datagrams.
pub trait WirePacketHandler: Send + Sync {
    fn on_wire_packet(&self, socket: LocalSocket, from: SocketAddr, data: &[u8]);
}

/// Interface name prefixes never bound, before any user blacklist.
const BUILTIN_PREFIX_BLACKLIST: &[&str] = &["lo", "ppp", "utun", "tun", "tap", "feth", "zt"];

/// How many consecutive ports to try when a bind fails.
pub const PORT_SEARCH_SPAN: u16 = 1000;

const RECV_BUFFER: usize = 16 * 1024;

struct BoundSocket {
    addr: SocketAddr,
    iface: String,
    socket: Arc<UdpSocket>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// The binder. Sockets are exclusively owned here; nothing else reads
/// from them.
pub struct Binder {
    runtime: tokio::runtime::Handle,
    sockets: Mutex<HashMap<u64, Arc<BoundSocket>>>,
    next_handle: AtomicU64,
}

impl Binder {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime,
            sockets: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Reconcile bound sockets against the host's current interface
    /// addresses. `tap_addrs` are our own virtual addresses, excluded to
    /// prevent running the overlay over itself.
    pub fn refresh(
        &self,
        ports: &[u16],
        config: &ServiceConfig,
        tap_addrs: &HashSet<IpAddr>,
        handler: &Arc<dyn WirePacketHandler>,
    ) {
        let mut desired: HashSet<(IpAddr, u16, String)> = HashSet::new();
        let networks = Networks::new_with_refreshed_list();
        for (name, data) in networks.iter() {
            for ipn in data.ip_networks() {
                let ip = ipn.addr;
                if !address_usable(name, &ip, config, tap_addrs) {
                    continue;
                }
                for port in ports.iter().filter(|p| **p != 0) {
                    desired.insert((ip, *port, name.clone()));
                }
            }
        }
        for explicit in &config.explicit_bind {
            desired.insert((explicit.ip(), explicit.port(), String::new()));
        }

        let mut sockets = self.sockets.lock();

        // Close sockets whose address vanished
        let stale: Vec<u64> = sockets
            .iter()
            .filter(|(_, s)| {
                !desired
                    .iter()
                    .any(|(ip, port, _)| s.addr == SocketAddr::new(*ip, *port))
            })
            .map(|(h, _)| *h)
            .collect();
        for handle in stale {
            if let Some(s) = sockets.remove(&handle) {
                info!(addr = %s.addr, "closing vanished binding");
            }
        }

        // Open sockets for new addresses
        for (ip, port, iface) in desired {
            let addr = SocketAddr::new(ip, port);
            if sockets.values().any(|s| s.addr == addr) {
                continue;
            }
            match open_udp(addr) {
                Ok(socket) => {
                    let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                    let socket = Arc::new(socket);
                    let bound = Arc::new(BoundSocket {
                        addr,
                        iface: iface.clone(),
                        socket: socket.clone(),
                        task: Mutex::new(None),
                    });
                    let task_handler = handler.clone();
                    let task = self.runtime.spawn(async move {
                        let mut buf = vec![0u8; RECV_BUFFER];
                        loop {
                            match socket.recv_from(&mut buf).await {
                                Ok((len, from)) => {
                                    task_handler.on_wire_packet(
                                        LocalSocket(handle),
                                        from,
                                        &buf[..len],
                                    );
                                }
                                Err(e) => {
                                    warn!(%addr, error = %e, "udp recv error");
                                    break;
                                }
                            }
                        }
                    });
                    *bound.task.lock() = Some(task);
                    info!(%addr, iface = %iface, "bound udp socket");
                    sockets.insert(handle, bound);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "bind failed");
                }
            }
        }
    }

    /// Send on one specific socket. A non-zero IPv4 TTL is applied for
    /// this datagram only.
    pub fn send_on(&self, handle: LocalSocket, dest: SocketAddr, data: &[u8], ttl: u8) -> bool {
        let socket = {
            let sockets = self.sockets.lock();
            match sockets.get(&handle.0) {
                Some(s) => s.socket.clone(),
                None => return false,
            }
        };
        send_with_ttl(&socket, dest, data, ttl)
    }

    /// Send on every usable socket of the destination's family. Used when
    /// no known-good path exists yet.
    pub fn send_all(&self, dest: SocketAddr, data: &[u8], ttl: u8) -> bool {
        let targets: Vec<Arc<UdpSocket>> = {
            let sockets = self.sockets.lock();
            sockets
                .values()
                .filter(|s| s.addr.is_ipv4() == dest.is_ipv4())
                .map(|s| s.socket.clone())
                .collect()
        };
        let mut sent = false;
        for socket in targets {
            sent |= send_with_ttl(&socket, dest, data, ttl);
        }
        sent
    }

    /// Snapshot of every bound local address.
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        let sockets = self.sockets.lock();
        let mut out: Vec<SocketAddr> = sockets.values().map(|s| s.addr).collect();
        out.sort_unstable();
        out
    }

    /// Interface name a handle is bound on (diagnostics).
    pub fn interface_of(&self, handle: LocalSocket) -> Option<String> {
        self.sockets.lock().get(&handle.0).map(|s| s.iface.clone())
    }

    /// Close everything.
    pub fn close_all(&self) {
        self.sockets.lock().clear();
    }
}

fn send_with_ttl(socket: &UdpSocket, dest: SocketAddr, data: &[u8], ttl: u8) -> bool {
    if ttl > 0 && dest.is_ipv4() {
        let previous = socket.ttl().unwrap_or(64);
        let _ = socket.set_ttl(ttl as u32);
        let ok = socket.try_send_to(data, dest).is_ok();
        let _ = socket.set_ttl(previous);
        ok
    } else {
        socket.try_send_to(data, dest).is_ok()
    }
}

fn open_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    let _ = socket.set_send_buffer_size(1024 * 1024);
    socket.bind(&addr.into())?;
    let std_socket: StdUdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// The admission filter: loopback and tunnel interface prefixes, user
/// blacklists, unusable scopes, and our own virtual addresses.
pub fn address_usable(
    iface: &str,
    ip: &IpAddr,
    config: &ServiceConfig,
    tap_addrs: &HashSet<IpAddr>,
) -> bool {
    if BUILTIN_PREFIX_BLACKLIST.iter().any(|pfx| iface.starts_with(pfx))
        || config
            .interface_blacklist
            .iter()
            .any(|pfx| iface.starts_with(pfx.as_str()))
    {
        return false;
    }
    match scope_of(ip) {
        InetScope::Loopback | InetScope::LinkLocal | InetScope::Multicast => return false,
        InetScope::Private | InetScope::Shared | InetScope::Global => {}
    }
    if config.cidr_blacklist.iter().any(|c| cidr_contains(*c, ip)) {
        return false;
    }
    if tap_addrs.contains(ip) {
        return false;
    }
    true
}

/// Find a bindable port at or above `start`, trying up to
/// [`PORT_SEARCH_SPAN`] increments.
pub fn find_usable_port(start: u16) -> Option<u16> {
    let mut port = start;
    for _ in 0..PORT_SEARCH_SPAN {
        if port == 0 {
            return None;
        }
        if udp_test_bind(port) {
            return Some(port);
        }
        port = port.checked_add(1)?;
    }
    None
}

/// Whether a port can be bound on either the v4 or v6 wildcard.
pub fn udp_test_bind(port: u16) -> bool {
    StdUdpSocket::bind(
        &[
            SocketAddr::from(([0, 0, 0, 0], port)),
            SocketAddr::from(([0u16; 8], port)),
        ][..],
    )
    .is_ok()
}

/// A random primary port in the dynamic range.
pub fn random_dynamic_port() -> u16 {
    20000 + (rand::random::<u16>() % 45535)
}

/// The secondary port derived from a node address, chosen to make
/// colocated nodes land on different NAT mappings.
pub fn secondary_port_for(node: zerolink_core::NodeId) -> u16 {
    20000 + (node.0 % 45500) as u16
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn cfg() -> ServiceConfig {
        ServiceConfig::default()
    }

    #[test]
    fn builtin_prefixes_are_refused() {
        let taps = HashSet::new();
        let ip: IpAddr = "192.168.1.10".parse().unwrap();
        for iface in ["lo", "lo0", "utun3", "tun0", "tap1", "feth99", "zt7nnig26", "ppp0"] {
            assert!(!address_usable(iface, &ip, &cfg(), &taps), "{iface}");
        }
        assert!(address_usable("eth0", &ip, &cfg(), &taps));
        assert!(address_usable("en0", &ip, &cfg(), &taps));
    }

    #[test]
    fn user_blacklists_are_honored() {
        let taps = HashSet::new();
        let mut config = cfg();
        config.interface_blacklist.push("docker".into());
        config.cidr_blacklist.push(("192.168.0.0".parse().unwrap(), 16));
        assert!(!address_usable("docker0", &"10.0.0.1".parse().unwrap(), &config, &taps));
        assert!(!address_usable("eth0", &"192.168.1.1".parse().unwrap(), &config, &taps));
        assert!(address_usable("eth0", &"10.0.0.1".parse().unwrap(), &config, &taps));
    }

    #[test]
    fn own_tap_addresses_are_refused() {
        let mut taps = HashSet::new();
        taps.insert("10.7.0.5".parse().unwrap());
        assert!(!address_usable("eth0", &"10.7.0.5".parse().unwrap(), &cfg(), &taps));
        assert!(address_usable("eth0", &"10.7.0.6".parse().unwrap(), &cfg(), &taps));
    }

    #[test]
    fn unusable_scopes_are_refused() {
        let taps = HashSet::new();
        assert!(!address_usable("eth0", &"127.0.0.1".parse().unwrap(), &cfg(), &taps));
        assert!(!address_usable("eth0", &"169.254.1.1".parse().unwrap(), &cfg(), &taps));
        assert!(!address_usable("eth0", &"fe80::1".parse().unwrap(), &cfg(), &taps));
        assert!(address_usable("eth0", &"100.100.1.1".parse().unwrap(), &cfg(), &taps));
    }

    #[test]
    fn secondary_port_is_deterministic_and_in_range() {
        let node = zerolink_core::NodeId::new(0x9f65ea1234);
        let p = secondary_port_for(node);
        assert_eq!(p, secondary_port_for(node));
        assert!((20000..65500).contains(&p));
    }

    #[test]
    fn random_primary_port_is_in_dynamic_range() {
        for _ in 0..64 {
            let p = random_dynamic_port();
            assert!(p >= 20000);
        }
    }

    #[test]
    fn port_search_skips_taken_ports() {
        // Grab a concrete port, then ask for it: the search must land on
        // a different one.
        let held = StdUdpSocket::bind("0.0.0.0:0").unwrap();
        let taken = held.local_addr().unwrap().port();
        let found = find_usable_port(taken).unwrap();
        assert!(found >= taken);
    }

    #[tokio::test]
    async fn explicit_bind_and_send() {
        struct Sink(Mutex<Vec<(SocketAddr, Vec<u8>)>>);
        impl WirePacketHandler for Sink {
            fn on_wire_packet(&self, _s: LocalSocket, from: SocketAddr, data: &[u8]) {
                self.0.lock().push((from, data.to_vec()));
            }
        }

        let binder = Binder::new(tokio::runtime::Handle::current());
        let port = find_usable_port(41000).unwrap();
        let mut config = ServiceConfig::default();
        config.explicit_bind.push(SocketAddr::from(([127, 0, 0, 1], port)));
        let handler: Arc<dyn WirePacketHandler> = Arc::new(Sink(Mutex::new(Vec::new())));
        binder.refresh(&[], &config, &HashSet::new(), &handler);
        assert_eq!(binder.bound_addresses(), vec![SocketAddr::from(([127, 0, 0, 1], port))]);

        // Loop a datagram through the bound socket
        let probe = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        probe.send_to(b"ping", ("127.0.0.1", port)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let ok = binder.send_all(probe.local_addr().unwrap(), b"pong", 0);
        assert!(ok);
        let mut buf = [0u8; 16];
        probe.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
        let (n, _) = probe.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");

        binder.close_all();
    }
}
