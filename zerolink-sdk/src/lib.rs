#![forbid(unsafe_code)]

//! Embeddable API surface.
//!
//! One service instance per process, held behind a module-level handle.
//! Lifecycle calls (`start`, `stop`, `free`) and network membership
//! return stable [`ReturnCode`] integers; socket calls additionally set
//! the thread-local [`errno`]. Every socket entry point performs the
//! same three checks before touching the stack: the service is up, the
//! arguments are structurally valid, and only then is the call passed
//! through.
//!
//! `free` is terminal. The in-process stack cannot be re-created, so
//! after `free` every lifecycle call fails for the remaining life of
//! the process; a restart requires a new process.

pub mod id;
pub mod ipaddr;
pub mod sockaddr;

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use zerolink_core::ipv6::{rfc4193_addr, sixplane_addr};
use zerolink_core::{
    Event, MulticastGroup, NetworkId, NetworkInfo, NodeId, PeerInfo, ReturnCode, ServiceConfig,
};
use zerolink_service::{EventHandler, Service};
use zerolink_stack::errno::{set_errno, Errno};
use zerolink_stack::sockets::opt;
use zerolink_stack::{FdSet, PollFd};

pub use zerolink_core::events::EventMessage;
pub use zerolink_core::ReturnCode as Code;
pub use zerolink_core::{Mac, MulticastGroup as Group};
pub use zerolink_stack::errno::errno;
pub use zerolink_stack::{AF_INET, AF_INET6, SOCK_DGRAM, SOCK_RAW, SOCK_STREAM};

/// Re-exported so embedders configure without importing the core crate.
pub use zerolink_core::ServiceConfig as Config;

struct Global {
    service: Option<Arc<Service>>,
    freed: bool,
}

/// The per-process service handle plus the startup flags guarding
/// double-start and start-after-free.
static GLOBAL: Lazy<Mutex<Global>> = Lazy::new(|| {
    Mutex::new(Global { service: None, freed: false })
});

fn with_service<R>(f: impl FnOnce(&Arc<Service>) -> R) -> Result<R, i32> {
    let global = GLOBAL.lock();
    match &global.service {
        Some(service) => Ok(f(service)),
        None => Err(ReturnCode::Service as i32),
    }
}

/// Pre-checks shared by every socket call: service constructed, node
/// online, stack running.
fn with_ready<R>(f: impl FnOnce(&Arc<Service>) -> R) -> Result<R, i32> {
    let global = GLOBAL.lock();
    match &global.service {
        Some(service) if service.is_ready() => Ok(f(service)),
        _ => {
            set_errno(Errno::ENOTCONN);
            Err(ReturnCode::Service as i32)
        }
    }
}

// ----------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------

/// Start the service. At most one start per process; starting after
/// `free` (or while already started) is an invalid operation.
pub fn start(config: ServiceConfig, handler: Option<Arc<dyn EventHandler>>) -> i32 {
    let mut global = GLOBAL.lock();
    if global.freed || global.service.is_some() {
        return ReturnCode::Service as i32;
    }
    match Service::start(config, handler) {
        Ok(service) => {
            global.service = Some(service);
            ReturnCode::Ok as i32
        }
        Err(e) => e.return_code() as i32,
    }
}

/// Start with a home directory and default settings.
pub fn start_home(home: &str, handler: Option<Arc<dyn EventHandler>>) -> i32 {
    start(ServiceConfig::default().with_home(home), handler)
}

/// Stop the service. The stack stays initialized until [`free`].
pub fn stop() -> i32 {
    let global = GLOBAL.lock();
    match &global.service {
        Some(service) => {
            service.stop();
            ReturnCode::Ok as i32
        }
        None => ReturnCode::Service as i32,
    }
}

/// Terminal teardown: stop everything including the stack. After this
/// returns, no start can succeed in this process.
pub fn free() -> i32 {
    let mut global = GLOBAL.lock();
    global.freed = true;
    match global.service.take() {
        Some(service) => {
            service.free();
            ReturnCode::Ok as i32
        }
        None => ReturnCode::Service as i32,
    }
}

/// Milliseconds of portability sleep for tests and examples.
pub fn delay_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

// ----------------------------------------------------------------------
// Node and network state
// ----------------------------------------------------------------------

/// The running node's overlay address.
pub fn node_id() -> Option<NodeId> {
    with_service(|s| s.node_id()).ok()
}

/// Whether the node can reach the overlay.
pub fn node_online() -> bool {
    with_service(|s| s.node_online()).unwrap_or(false)
}

pub fn join(nwid: NetworkId) -> i32 {
    match with_service(|s| s.join(nwid)) {
        Ok(Ok(())) => ReturnCode::Ok as i32,
        Ok(Err(e)) => e.return_code() as i32,
        Err(code) => code,
    }
}

pub fn leave(nwid: NetworkId) -> i32 {
    match with_service(|s| s.leave(nwid)) {
        Ok(Ok(())) => ReturnCode::Ok as i32,
        Ok(Err(e)) => e.return_code() as i32,
        Err(code) => code,
    }
}

pub fn leave_all() -> i32 {
    match with_service(|s| s.leave_all()) {
        Ok(Ok(())) => ReturnCode::Ok as i32,
        Ok(Err(e)) => e.return_code() as i32,
        Err(code) => code,
    }
}

pub fn orbit(moon_id: u64, moon_seed: u64) -> i32 {
    match with_service(|s| s.orbit(moon_id, moon_seed)) {
        Ok(Ok(())) => ReturnCode::Ok as i32,
        Ok(Err(e)) => e.return_code() as i32,
        Err(code) => code,
    }
}

pub fn deorbit(moon_id: u64) -> i32 {
    match with_service(|s| s.deorbit(moon_id)) {
        Ok(Ok(())) => ReturnCode::Ok as i32,
        Ok(Err(e)) => e.return_code() as i32,
        Err(code) => code,
    }
}

/// Subscribe the virtual interface to a multicast group (MAC plus
/// additional distinguishing information, ADI). Groups derived from
/// assigned addresses are managed automatically; this registers an
/// application-chosen one.
pub fn multicast_subscribe(nwid: NetworkId, mac: Mac, adi: u32) -> i32 {
    match with_service(|s| s.multicast_subscribe(nwid, MulticastGroup { mac, adi })) {
        Ok(Ok(())) => ReturnCode::Ok as i32,
        Ok(Err(e)) => e.return_code() as i32,
        Err(code) => code,
    }
}

/// Drop a multicast subscription.
pub fn multicast_unsubscribe(nwid: NetworkId, mac: Mac, adi: u32) -> i32 {
    match with_service(|s| s.multicast_unsubscribe(nwid, MulticastGroup { mac, adi })) {
        Ok(Ok(())) => ReturnCode::Ok as i32,
        Ok(Err(e)) => e.return_code() as i32,
        Err(code) => code,
    }
}

/// Snapshot one network's state.
pub fn network_info(nwid: NetworkId) -> Option<NetworkInfo> {
    with_service(|s| s.network_info(nwid)).ok().flatten()
}

/// Snapshot all peers.
pub fn peers() -> Vec<PeerInfo> {
    with_service(|s| s.peers()).unwrap_or_default()
}

/// Direct / relay / unreachable classification for a peer.
pub fn peer_status(peer: NodeId) -> Event {
    with_service(|s| s.peer_status(peer)).unwrap_or(Event::PeerUnreachable)
}

/// Register a static address hint for first contact with a peer.
pub fn add_peer_address(peer: NodeId, addr: SocketAddr) -> i32 {
    match with_service(|s| s.add_peer_hint(peer, addr)) {
        Ok(()) => ReturnCode::Ok as i32,
        Err(code) => code,
    }
}

/// This node's RFC 4193 address on a network.
pub fn rfc4193_address(nwid: NetworkId) -> Option<Ipv6Addr> {
    node_id().map(|node| rfc4193_addr(nwid, node))
}

/// This node's 6PLANE address on a network.
pub fn sixplane_address(nwid: NetworkId) -> Option<Ipv6Addr> {
    node_id().map(|node| sixplane_addr(nwid, node))
}

// ----------------------------------------------------------------------
// Sockets
// ----------------------------------------------------------------------

pub fn socket(family: i32, kind: i32, protocol: i32) -> i32 {
    with_ready(|s| s.sockets().socket(family, kind, protocol)).unwrap_or_else(|c| c)
}

pub fn close(fd: i32) -> i32 {
    with_ready(|s| s.sockets().close(fd)).unwrap_or_else(|c| c)
}

pub fn bind(fd: i32, addr: SocketAddr) -> i32 {
    with_ready(|s| s.sockets().bind(fd, addr)).unwrap_or_else(|c| c)
}

/// Bind from a packed sockaddr buffer (wrapper parity). The buffer
/// length plays the role of `addrlen` and the classic window applies.
pub fn bind_raw(fd: i32, addr: &[u8]) -> i32 {
    match sockaddr::decode(addr) {
        Some(sa) => bind(fd, sa),
        None => ReturnCode::Arg as i32,
    }
}

/// Easy bind by presentation-form address.
pub fn bind_str(fd: i32, ip: &str, port: u16) -> i32 {
    match ipaddr::ipaddr_aton(ip) {
        Some(ip) => bind(fd, SocketAddr::new(ip, port)),
        None => ReturnCode::Arg as i32,
    }
}

pub fn listen(fd: i32, backlog: i32) -> i32 {
    with_ready(|s| s.sockets().listen(fd, backlog)).unwrap_or_else(|c| c)
}

pub fn accept(fd: i32) -> i32 {
    with_ready(|s| s.sockets().accept(fd)).unwrap_or_else(|c| c)
}

pub fn connect(fd: i32, addr: SocketAddr) -> i32 {
    with_ready(|s| s.sockets().connect(fd, addr)).unwrap_or_else(|c| c)
}

/// Connect from a packed sockaddr buffer (wrapper parity).
pub fn connect_raw(fd: i32, addr: &[u8]) -> i32 {
    match sockaddr::decode(addr) {
        Some(sa) => connect(fd, sa),
        None => ReturnCode::Arg as i32,
    }
}

/// Easy connect by presentation-form address. A zero timeout selects
/// the default (about thirty seconds: the overlay's first-contact path
/// drops early SYNs while the route forms).
pub fn connect_str(fd: i32, ip: &str, port: u16, timeout_ms: u32) -> i32 {
    let Some(ip) = ipaddr::ipaddr_aton(ip) else {
        return ReturnCode::Arg as i32;
    };
    let addr = SocketAddr::new(ip, port);
    with_ready(|s| {
        if timeout_ms == 0 {
            s.sockets().connect(fd, addr)
        } else {
            s.sockets()
                .connect_timeout(fd, addr, Duration::from_millis(timeout_ms as u64))
        }
    })
    .unwrap_or_else(|c| c)
}

pub fn send(fd: i32, buf: &[u8]) -> isize {
    with_ready(|s| s.sockets().send(fd, buf)).unwrap_or_else(|c| c as isize)
}

pub fn sendto(fd: i32, buf: &[u8], addr: SocketAddr) -> isize {
    with_ready(|s| s.sockets().sendto(fd, buf, addr)).unwrap_or_else(|c| c as isize)
}

pub fn recv(fd: i32, buf: &mut [u8]) -> isize {
    with_ready(|s| s.sockets().recv(fd, buf)).unwrap_or_else(|c| c as isize)
}

/// Receive with the sender's address.
pub fn recvfrom(fd: i32, buf: &mut [u8]) -> (isize, Option<SocketAddr>) {
    match with_ready(|s| s.sockets().recvfrom(fd, buf)) {
        Ok(Ok((n, from))) => (n, from),
        Ok(Err(_)) => (-1, None),
        Err(code) => (code as isize, None),
    }
}

/// `read(2)` alias for stream sockets.
pub fn read(fd: i32, buf: &mut [u8]) -> isize {
    recv(fd, buf)
}

/// `write(2)` alias for stream sockets.
pub fn write(fd: i32, buf: &[u8]) -> isize {
    send(fd, buf)
}

pub fn shutdown(fd: i32, direction: i32) -> i32 {
    with_ready(|s| s.sockets().shutdown(fd, direction)).unwrap_or_else(|c| c)
}

pub fn getsockname(fd: i32) -> Option<SocketAddr> {
    with_ready(|s| s.sockets().getsockname(fd)).ok().and_then(|r| r.ok())
}

pub fn getpeername(fd: i32) -> Option<SocketAddr> {
    with_ready(|s| s.sockets().getpeername(fd)).ok().and_then(|r| r.ok())
}

pub fn setsockopt(fd: i32, level: i32, optname: i32, value: i32) -> i32 {
    with_ready(|s| s.sockets().setsockopt_int(fd, level, optname, value)).unwrap_or_else(|c| c)
}

pub fn getsockopt(fd: i32, level: i32, optname: i32) -> Result<i32, i32> {
    with_ready(|s| s.sockets().getsockopt_int(fd, level, optname))
        .map_err(|c| c)
        .and_then(|r| r.map_err(|_| ReturnCode::Socket as i32))
}

/// SO_RCVTIMEO with timeval semantics (seconds + microseconds).
pub fn set_recv_timeout(fd: i32, seconds: i64, micros: i64) -> i32 {
    with_ready(|s| s.sockets().set_timeout_opt(fd, opt::SO_RCVTIMEO, seconds, micros))
        .unwrap_or_else(|c| c)
}

/// SO_SNDTIMEO with timeval semantics.
pub fn set_send_timeout(fd: i32, seconds: i64, micros: i64) -> i32 {
    with_ready(|s| s.sockets().set_timeout_opt(fd, opt::SO_SNDTIMEO, seconds, micros))
        .unwrap_or_else(|c| c)
}

/// Toggle blocking mode (true = blocking).
pub fn set_blocking(fd: i32, blocking: bool) -> i32 {
    with_ready(|s| s.sockets().set_nonblocking(fd, !blocking)).unwrap_or_else(|c| c)
}

/// Whether the socket is in blocking mode.
pub fn get_blocking(fd: i32) -> Result<bool, i32> {
    with_ready(|s| s.sockets().nonblocking(fd))
        .map_err(|c| c)
        .and_then(|r| r.map(|nb| !nb).map_err(|_| ReturnCode::Socket as i32))
}

pub fn fcntl(fd: i32, cmd: i32, flags: i32) -> i32 {
    with_ready(|s| s.sockets().fcntl(fd, cmd, flags)).unwrap_or_else(|c| c)
}

pub fn ioctl(fd: i32, request: i64, arg: &mut i32) -> i32 {
    with_ready(|s| s.sockets().ioctl(fd, request, arg)).unwrap_or_else(|c| c)
}

pub fn select(
    readfds: Option<&mut FdSet>,
    writefds: Option<&mut FdSet>,
    exceptfds: Option<&mut FdSet>,
    timeout: Option<Duration>,
) -> i32 {
    with_ready(|s| s.sockets().select(readfds, writefds, exceptfds, timeout))
        .unwrap_or_else(|c| c)
}

pub fn poll(fds: &mut [PollFd], timeout: Option<Duration>) -> i32 {
    with_ready(|s| s.sockets().poll(fds, timeout)).unwrap_or_else(|c| c)
}

/// Register a DNS nameserver with the stack (resolution is the
/// application's business; at most two are stored).
pub fn add_dns_nameserver(addr: SocketAddr) -> i32 {
    with_ready(|s| s.sockets().add_nameserver(addr)).unwrap_or_else(|c| c)
}

/// Remove a registered DNS nameserver.
pub fn del_dns_nameserver(addr: SocketAddr) -> i32 {
    with_ready(|s| s.sockets().del_nameserver(addr)).unwrap_or_else(|c| c)
}

/// Aggregate per-layer stack counters.
pub fn stack_stats() -> Option<Vec<(&'static str, zerolink_stack::stats::LayerSnapshot)>> {
    with_ready(|s| {
        let st = s.stack_stats();
        vec![
            ("link", st.link.snapshot()),
            ("arp", st.arp.snapshot()),
            ("ipv4", st.ipv4.snapshot()),
            ("ipv6", st.ipv6.snapshot()),
            ("icmpv4", st.icmpv4.snapshot()),
            ("icmpv6", st.icmpv6.snapshot()),
            ("udp", st.udp.snapshot()),
            ("tcp", st.tcp.snapshot()),
            ("nd6", st.nd6.snapshot()),
        ]
    })
    .ok()
}

/// Convenience: derive an ad-hoc network ID from an inclusive port range.
pub fn adhoc_network_id(start_port: u16, end_port: u16) -> NetworkId {
    NetworkId::adhoc(start_port, end_port)
}

/// True while the stack and node are both up (socket calls will pass
/// their lifecycle check).
pub fn ready() -> bool {
    with_service(|s| s.is_ready()).unwrap_or(false)
}
