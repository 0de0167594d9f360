//! BSD-style socket layer over the stack driver.
//!
//! File descriptors are small non-negative integers, unique among open
//! sockets and reusable after close. Every call validates its arguments,
//! performs the operation under the driver's core lock, and reports
//! failure as a negative return with the detail in the thread-local
//! [`crate::errno::errno`]. Blocking calls honor the per-socket
//! non-blocking flag and timeouts.
//!
//! A `recv` return of 0 always means orderly remote shutdown; "no data
//! right now" on a non-blocking socket is -1 with `EAGAIN`.
//!
//! Lock order is socket-then-core, without exception: an operation takes
//! its socket's mutex first and holds it across any waiting, acquiring
//! the core lock only inside. The readiness scans in `select`/`poll`
//! run under the core lock and therefore only ever `try_lock` sockets.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::{icmp, tcp, udp};
use smoltcp::wire::{IpEndpoint, IpListenEndpoint};
use tracing::debug;

use zerolink_core::cidr_contains;

use crate::driver::{from_smol_ip, to_smol_ip, CoreState, NetifId, StackDriver, StackPhase};
use crate::errno::{clear_errno, set_errno, Errno};

/// Address family constants (namespaced; values match the classic ones so
/// ported code reads naturally).
pub const AF_INET: i32 = 2;
#[allow(missing_docs)]
pub const AF_INET6: i32 = 10;
#[allow(missing_docs)]
pub const SOCK_STREAM: i32 = 1;
#[allow(missing_docs)]
pub const SOCK_DGRAM: i32 = 2;
#[allow(missing_docs)]
pub const SOCK_RAW: i32 = 3;

/// Socket option levels and names.
#[allow(missing_docs)]
pub mod opt {
    pub const SOL_SOCKET: i32 = 0x0fff;
    pub const IPPROTO_IP: i32 = 0;
    pub const IPPROTO_TCP: i32 = 6;
    pub const IPPROTO_IPV6: i32 = 41;

    pub const SO_DEBUG: i32 = 0x0001;
    pub const SO_ACCEPTCONN: i32 = 0x0002;
    pub const SO_REUSEADDR: i32 = 0x0004;
    pub const SO_KEEPALIVE: i32 = 0x0008;
    pub const SO_DONTROUTE: i32 = 0x0010;
    pub const SO_BROADCAST: i32 = 0x0020;
    pub const SO_USELOOPBACK: i32 = 0x0040;
    pub const SO_LINGER: i32 = 0x0080;
    pub const SO_OOBINLINE: i32 = 0x0100;
    pub const SO_REUSEPORT: i32 = 0x0200;
    pub const SO_SNDBUF: i32 = 0x1001;
    pub const SO_RCVBUF: i32 = 0x1002;
    pub const SO_SNDLOWAT: i32 = 0x1003;
    pub const SO_RCVLOWAT: i32 = 0x1004;
    pub const SO_SNDTIMEO: i32 = 0x1005;
    pub const SO_RCVTIMEO: i32 = 0x1006;
    pub const SO_ERROR: i32 = 0x1007;
    pub const SO_TYPE: i32 = 0x1008;

    pub const IP_TOS: i32 = 1;
    pub const IP_TTL: i32 = 2;
    pub const TCP_NODELAY: i32 = 0x01;
    pub const TCP_KEEPALIVE: i32 = 0x02;
}

/// `fcntl` commands and flags.
#[allow(missing_docs)]
pub mod fcntl {
    pub const F_GETFL: i32 = 3;
    pub const F_SETFL: i32 = 4;
    pub const O_NONBLOCK: i32 = 0x0800;
}

/// `ioctl` requests.
#[allow(missing_docs)]
pub mod ioctl {
    pub const FIONREAD: i64 = 0x541b;
    pub const FIONBIO: i64 = 0x5421;
}

/// `shutdown` directions.
#[allow(missing_docs)]
pub mod how {
    pub const SHUT_RD: i32 = 0;
    pub const SHUT_WR: i32 = 1;
    pub const SHUT_RDWR: i32 = 2;
}

/// Socket address used across the socket surface.
pub type SockAddr = SocketAddr;

/// Default blocking-connect retry window. The overlay's first-contact
/// path loses the first few SYNs while peers handshake, so a plain
/// single-SYN connect would fail spuriously.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(250);

const TCP_BUFFER_SIZE: usize = 64 * 1024;
const UDP_PACKET_SLOTS: usize = 64;
const UDP_BUFFER_SIZE: usize = 64 * 1024;
const MAX_LISTEN_BACKLOG: usize = 8;
const WAIT_SLICE: Duration = Duration::from_millis(50);

struct Listen {
    endpoint: IpListenEndpoint,
    pool: Vec<SocketHandle>,
}

enum Proto {
    Tcp {
        handle: Option<SocketHandle>,
        listen: Option<Listen>,
        local: Option<IpListenEndpoint>,
        connecting: bool,
    },
    Udp {
        handle: SocketHandle,
        bound: bool,
        remote: Option<IpEndpoint>,
    },
    Icmp {
        handle: SocketHandle,
    },
}

struct VSocket {
    family: i32,
    kind: i32,
    protocol: i32,
    nonblocking: bool,
    recv_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    /// Linger-on-close in seconds; `None` disables lingering.
    linger: Option<u32>,
    ttl: u8,
    keepalive: bool,
    nodelay: bool,
    recv_shutdown: bool,
    so_error: i32,
    /// Last-set values for accepted-but-unimplemented options; reads
    /// return these rather than any effective value.
    raw_opts: HashMap<(i32, i32), i32>,
    proto: Proto,
}

impl VSocket {
    fn fresh(family: i32, kind: i32, protocol: i32, proto: Proto) -> Self {
        Self {
            family,
            kind,
            protocol,
            nonblocking: false,
            recv_timeout: None,
            send_timeout: None,
            linger: None,
            ttl: 255,
            keepalive: false,
            nodelay: false,
            recv_shutdown: false,
            so_error: 0,
            raw_opts: HashMap::new(),
            proto,
        }
    }
}

/// The socket layer. Owned by the service; the SDK routes all socket
/// calls here after its lifecycle checks.
pub struct SocketLayer {
    driver: Arc<StackDriver>,
    fds: DashMap<i32, Arc<PlMutex<VSocket>>>,
    free_fds: PlMutex<Vec<i32>>,
    next_fd: AtomicI32,
    bound_tcp: PlMutex<HashSet<u16>>,
    bound_udp: PlMutex<HashSet<u16>>,
    nameservers: PlMutex<Vec<SocketAddr>>,
}

impl SocketLayer {
    pub fn new(driver: Arc<StackDriver>) -> Self {
        Self {
            driver,
            fds: DashMap::new(),
            free_fds: PlMutex::new(Vec::new()),
            next_fd: AtomicI32::new(0),
            bound_tcp: PlMutex::new(HashSet::new()),
            bound_udp: PlMutex::new(HashSet::new()),
            nameservers: PlMutex::new(Vec::new()),
        }
    }

    fn alloc_fd(&self) -> i32 {
        if let Some(fd) = self.free_fds.lock().pop() {
            return fd;
        }
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    fn release_fd(&self, fd: i32) {
        self.free_fds.lock().push(fd);
    }

    fn get(&self, fd: i32) -> Option<Arc<PlMutex<VSocket>>> {
        self.fds.get(&fd).map(|e| e.value().clone())
    }

    /// Number of currently open sockets.
    pub fn open_count(&self) -> usize {
        self.fds.len()
    }

    // ------------------------------------------------------------------
    // Creation / teardown
    // ------------------------------------------------------------------

    /// `socket(2)`.
    pub fn socket(&self, family: i32, kind: i32, protocol: i32) -> i32 {
        clear_errno();
        if family != AF_INET && family != AF_INET6 {
            return fail(Errno::EAFNOSUPPORT);
        }
        let proto = match kind {
            SOCK_STREAM => Proto::Tcp { handle: None, listen: None, local: None, connecting: false },
            SOCK_DGRAM => {
                let handle = self.driver.core().with_state(|st| {
                    st.sockets.add(udp::Socket::new(
                        udp::PacketBuffer::new(
                            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
                            vec![0u8; UDP_BUFFER_SIZE],
                        ),
                        udp::PacketBuffer::new(
                            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
                            vec![0u8; UDP_BUFFER_SIZE],
                        ),
                    ))
                });
                Proto::Udp { handle, bound: false, remote: None }
            }
            SOCK_RAW => {
                let handle = self.driver.core().with_state(|st| {
                    st.sockets.add(icmp::Socket::new(
                        icmp::PacketBuffer::new(
                            vec![icmp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
                            vec![0u8; UDP_BUFFER_SIZE],
                        ),
                        icmp::PacketBuffer::new(
                            vec![icmp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
                            vec![0u8; UDP_BUFFER_SIZE],
                        ),
                    ))
                });
                Proto::Icmp { handle }
            }
            _ => return fail(Errno::EPROTONOSUPPORT),
        };
        let fd = self.alloc_fd();
        self.fds
            .insert(fd, Arc::new(PlMutex::new(VSocket::fresh(family, kind, protocol, proto))));
        debug!(fd, family, kind, "socket created");
        fd
    }

    /// `close(2)`. Releases stack resources even when the peer never acks
    /// pending data, unless lingering is enabled on the socket.
    pub fn close(&self, fd: i32) -> i32 {
        clear_errno();
        let Some((_, entry)) = self.fds.remove(&fd) else {
            return fail(Errno::EBADF);
        };
        let mut vs = entry.lock();
        let linger = vs.linger;
        let nonblocking = vs.nonblocking;
        match &mut vs.proto {
            Proto::Tcp { handle, listen, local, .. } => {
                if let Some(l) = local {
                    self.bound_tcp.lock().remove(&l.port);
                }
                if let Some(listen) = listen.take() {
                    self.driver.core().with_state(|st| {
                        for h in listen.pool {
                            st.sockets.get_mut::<tcp::Socket>(h).abort();
                            st.sockets.remove(h);
                        }
                    });
                }
                if let Some(h) = handle.take() {
                    if let Some(secs) = linger {
                        if secs > 0 && !nonblocking {
                            // Bounded wait for the send queue to drain
                            let _ = self.wait_on_core(
                                Some(Duration::from_secs(secs as u64)),
                                Errno::ETIMEDOUT,
                                |st| {
                                    (st.sockets.get::<tcp::Socket>(h).send_queue() == 0)
                                        .then_some(())
                                },
                            );
                        }
                    }
                    self.driver.core().with_state(|st| {
                        let deadline = smoltcp::time::Instant::now().total_millis()
                            + crate::driver::GRAVEYARD_LINGER_MS;
                        if linger == Some(0) {
                            st.sockets.get_mut::<tcp::Socket>(h).abort();
                        } else {
                            st.sockets.get_mut::<tcp::Socket>(h).close();
                        }
                        st.graveyard.push((h, deadline));
                    });
                }
            }
            Proto::Udp { handle, bound, .. } => {
                let h = *handle;
                let was_bound = *bound;
                self.driver.core().with_state(|st| {
                    let port = st.sockets.get::<udp::Socket>(h).endpoint().port;
                    st.sockets.get_mut::<udp::Socket>(h).close();
                    st.sockets.remove(h);
                    if was_bound {
                        self.bound_udp.lock().remove(&port);
                    }
                });
            }
            Proto::Icmp { handle } => {
                let h = *handle;
                self.driver.core().with_state(|st| {
                    st.sockets.remove(h);
                });
            }
        }
        drop(vs);
        self.release_fd(fd);
        debug!(fd, "socket closed");
        0
    }

    // ------------------------------------------------------------------
    // Binding / listening / accepting
    // ------------------------------------------------------------------

    /// `bind(2)`.
    pub fn bind(&self, fd: i32, addr: SockAddr) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        let mut vs = entry.lock();
        if !family_matches(vs.family, &addr) {
            return fail(Errno::EAFNOSUPPORT);
        }
        let mut port = addr.port();
        match &mut vs.proto {
            Proto::Tcp { local, handle, .. } => {
                if local.is_some() || handle.is_some() {
                    return fail(Errno::EINVAL);
                }
                if port == 0 {
                    port = self.driver.core().with_state(|st| st.ephemeral_port());
                } else if !self.bound_tcp.lock().insert(port) {
                    return fail(Errno::EADDRINUSE);
                }
                *local = Some(listen_endpoint(addr.ip(), port));
                0
            }
            Proto::Udp { handle, bound, .. } => {
                if *bound {
                    return fail(Errno::EINVAL);
                }
                if port == 0 {
                    port = self.driver.core().with_state(|st| st.ephemeral_port());
                } else if !self.bound_udp.lock().insert(port) {
                    return fail(Errno::EADDRINUSE);
                }
                let h = *handle;
                let ep = listen_endpoint(addr.ip(), port);
                let res = self
                    .driver
                    .core()
                    .with_state(|st| st.sockets.get_mut::<udp::Socket>(h).bind(ep));
                match res {
                    Ok(()) => {
                        *bound = true;
                        0
                    }
                    Err(_) => {
                        self.bound_udp.lock().remove(&port);
                        fail(Errno::EINVAL)
                    }
                }
            }
            Proto::Icmp { .. } => fail(Errno::EOPNOTSUPP),
        }
    }

    /// `listen(2)`. The socket must have been bound first; backlog sizes
    /// the pool of pending connections.
    pub fn listen(&self, fd: i32, backlog: i32) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        let mut vs = entry.lock();
        let Proto::Tcp { local, listen, handle, .. } = &mut vs.proto else {
            return fail(Errno::EOPNOTSUPP);
        };
        if handle.is_some() || listen.is_some() {
            return fail(Errno::EINVAL);
        }
        let Some(endpoint) = *local else {
            // Never bound: refuse rather than pick an address silently
            return fail(Errno::EDESTADDRREQ);
        };
        let pool_size = (backlog.max(1) as usize).min(MAX_LISTEN_BACKLOG);
        let pool = self.driver.core().with_state(|st| {
            let mut pool = Vec::with_capacity(pool_size);
            for _ in 0..pool_size {
                if let Some(h) = new_listening_socket(st, endpoint) {
                    pool.push(h);
                }
            }
            pool
        });
        if pool.is_empty() {
            return fail(Errno::EADDRINUSE);
        }
        *listen = Some(Listen { endpoint, pool });
        0
    }

    /// `accept(2)`. Returns the new connection's fd.
    pub fn accept(&self, fd: i32) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        let mut vs = entry.lock();
        if !matches!(&vs.proto, Proto::Tcp { listen: Some(_), .. }) {
            return fail(Errno::EINVAL);
        }
        let nonblocking = vs.nonblocking;
        let timeout = vs.recv_timeout;
        let (family, ttl, keepalive, nodelay) = (vs.family, vs.ttl, vs.keepalive, vs.nodelay);

        let accepted = {
            let vs = &mut *vs;
            self.block(nonblocking, timeout, Errno::EAGAIN, |st| {
                let Proto::Tcp { listen: Some(l), .. } = &mut vs.proto else { return None };
                let idx = l.pool.iter().position(|h| {
                    let s = st.sockets.get::<tcp::Socket>(*h);
                    matches!(s.state(), tcp::State::Established | tcp::State::CloseWait)
                })?;
                let h = l.pool.swap_remove(idx);
                if let Some(fresh) = new_listening_socket(st, l.endpoint) {
                    l.pool.push(fresh);
                }
                let s = st.sockets.get_mut::<tcp::Socket>(h);
                s.set_hop_limit(Some(ttl));
                s.set_nagle_enabled(!nodelay);
                s.set_keep_alive(keepalive.then(|| smoltcp::time::Duration::from_secs(75)));
                Some((h, l.endpoint))
            })
        };
        drop(vs);

        match accepted {
            Ok((h, endpoint)) => {
                let newfd = self.alloc_fd();
                let mut child = VSocket::fresh(family, SOCK_STREAM, 0, Proto::Tcp {
                    handle: Some(h),
                    listen: None,
                    local: Some(endpoint),
                    connecting: false,
                });
                child.ttl = ttl;
                child.keepalive = keepalive;
                child.nodelay = nodelay;
                self.fds.insert(newfd, Arc::new(PlMutex::new(child)));
                debug!(listener = fd, newfd, "accepted connection");
                newfd
            }
            Err(e) => fail(e),
        }
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// `connect(2)` with the default blocking timeout.
    pub fn connect(&self, fd: i32, addr: SockAddr) -> i32 {
        self.connect_timeout(fd, addr, DEFAULT_CONNECT_TIMEOUT)
    }

    /// `connect(2)` with an explicit bound on the blocking retry loop.
    pub fn connect_timeout(&self, fd: i32, addr: SockAddr, timeout: Duration) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        let mut vs = entry.lock();
        if !family_matches(vs.family, &addr) {
            return fail(Errno::EAFNOSUPPORT);
        }
        match &mut vs.proto {
            Proto::Udp { remote, .. } => {
                *remote = Some(ip_endpoint(addr));
                0
            }
            Proto::Icmp { .. } => fail(Errno::EOPNOTSUPP),
            Proto::Tcp { .. } => {
                let nonblocking = vs.nonblocking;
                if let Err(e) = self.tcp_initiate(&mut vs, addr) {
                    return fail(e);
                }
                if nonblocking {
                    return fail(Errno::EINPROGRESS);
                }
                self.tcp_connect_wait(&mut vs, addr, timeout)
            }
        }
    }

    /// Kick off a TCP connection attempt on a locked socket.
    fn tcp_initiate(&self, vs: &mut VSocket, addr: SockAddr) -> Result<(), i32> {
        let ttl = vs.ttl;
        let keepalive = vs.keepalive;
        let nodelay = vs.nodelay;
        let Proto::Tcp { handle, listen, local, connecting } = &mut vs.proto else {
            return Err(Errno::EINVAL);
        };
        if listen.is_some() {
            return Err(Errno::EOPNOTSUPP);
        }
        if *connecting {
            return Err(Errno::EALREADY);
        }
        if handle.is_some() {
            return Err(Errno::EISCONN);
        }
        let remote = ip_endpoint(addr);
        let local_ep = *local;
        let res = self.driver.core().with_state(|st| {
            if st.phase != StackPhase::Running {
                return Err(Errno::ENETDOWN);
            }
            let netif = pick_netif(st, addr.ip()).ok_or(Errno::ENETUNREACH)?;
            let local_ep = match local_ep {
                Some(ep) => ep,
                None => IpListenEndpoint::from(st.ephemeral_port()),
            };
            let mut socket = tcp::Socket::new(
                tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
                tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
            );
            socket.set_hop_limit(Some(ttl));
            socket.set_nagle_enabled(!nodelay);
            if keepalive {
                socket.set_keep_alive(Some(smoltcp::time::Duration::from_secs(75)));
            }
            let h = st.sockets.add(socket);
            let state = &mut *st;
            let Some(n) = state.netifs.get_mut(&netif) else {
                state.sockets.remove(h);
                return Err(Errno::ENETUNREACH);
            };
            let result = state
                .sockets
                .get_mut::<tcp::Socket>(h)
                .connect(n.iface.context(), remote, local_ep);
            match result {
                Ok(()) => Ok(h),
                Err(tcp::ConnectError::Unaddressable) => {
                    state.sockets.remove(h);
                    Err(Errno::EADDRNOTAVAIL)
                }
                Err(tcp::ConnectError::InvalidState) => {
                    state.sockets.remove(h);
                    Err(Errno::EISCONN)
                }
            }
        });
        match res {
            Ok(h) => {
                *handle = Some(h);
                *connecting = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Blocking connect: wait for establishment, re-sending the attempt
    /// while the window lasts. Refused attempts back off briefly and
    /// retry, because the first SYNs routinely die while the overlay
    /// discovers a path to the peer.
    fn tcp_connect_wait(&self, vs: &mut VSocket, addr: SockAddr, timeout: Duration) -> i32 {
        let deadline = StdInstant::now() + timeout;
        loop {
            let status = {
                let vs2 = &mut *vs;
                self.block(
                    false,
                    Some(deadline.saturating_duration_since(StdInstant::now())),
                    Errno::ETIMEDOUT,
                    |st| {
                        let Proto::Tcp { handle: Some(h), .. } = &vs2.proto else {
                            return Some(Err(Errno::EINVAL));
                        };
                        match st.sockets.get::<tcp::Socket>(*h).state() {
                            tcp::State::Established => Some(Ok(())),
                            tcp::State::Closed => Some(Err(Errno::ECONNREFUSED)),
                            _ => None,
                        }
                    },
                )
            };
            match status {
                Ok(Ok(())) => {
                    if let Proto::Tcp { connecting, .. } = &mut vs.proto {
                        *connecting = false;
                    }
                    vs.so_error = 0;
                    return 0;
                }
                Ok(Err(Errno::ECONNREFUSED)) if StdInstant::now() < deadline => {
                    // Tear down the dead attempt, pause, try again
                    if let Proto::Tcp { handle, connecting, .. } = &mut vs.proto {
                        if let Some(h) = handle.take() {
                            self.driver.core().with_state(|st| {
                                st.sockets.remove(h);
                            });
                        }
                        *connecting = false;
                    }
                    std::thread::sleep(CONNECT_RETRY_PAUSE);
                    if let Err(e) = self.tcp_initiate(vs, addr) {
                        return fail(e);
                    }
                }
                Ok(Err(e)) | Err(e) => {
                    vs.so_error = e;
                    if let Proto::Tcp { connecting, .. } = &mut vs.proto {
                        *connecting = false;
                    }
                    return fail(e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Data transfer
    // ------------------------------------------------------------------

    /// `send(2)` / `write(2)`.
    pub fn send(&self, fd: i32, buf: &[u8]) -> isize {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) as isize };
        let mut vs = entry.lock();
        match &vs.proto {
            Proto::Tcp { .. } => self.tcp_send(&mut vs, buf),
            Proto::Udp { remote, .. } => match *remote {
                Some(remote) => self.udp_send(&mut vs, buf, remote),
                None => fail(Errno::EDESTADDRREQ) as isize,
            },
            Proto::Icmp { .. } => fail(Errno::EOPNOTSUPP) as isize,
        }
    }

    /// `sendto(2)`.
    pub fn sendto(&self, fd: i32, buf: &[u8], addr: SockAddr) -> isize {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) as isize };
        let mut vs = entry.lock();
        if !family_matches(vs.family, &addr) {
            return fail(Errno::EAFNOSUPPORT) as isize;
        }
        match &vs.proto {
            Proto::Udp { .. } => self.udp_send(&mut vs, buf, ip_endpoint(addr)),
            Proto::Tcp { .. } => self.tcp_send(&mut vs, buf),
            Proto::Icmp { .. } => fail(Errno::EOPNOTSUPP) as isize,
        }
    }

    fn tcp_send(&self, vs: &mut VSocket, buf: &[u8]) -> isize {
        let nonblocking = vs.nonblocking;
        let timeout = vs.send_timeout;
        let res = self.block(nonblocking, timeout, Errno::EAGAIN, |st| {
            let Proto::Tcp { handle: Some(h), .. } = &vs.proto else {
                return Some(Err(Errno::ENOTCONN));
            };
            let s = st.sockets.get_mut::<tcp::Socket>(*h);
            if !s.may_send() {
                return Some(Err(Errno::EPIPE));
            }
            if !s.can_send() {
                return None;
            }
            match s.send_slice(buf) {
                Ok(n) if n > 0 => Some(Ok(n as isize)),
                Ok(_) => None,
                Err(tcp::SendError::InvalidState) => Some(Err(Errno::ENOTCONN)),
            }
        });
        flatten(res)
    }

    fn udp_send(&self, vs: &mut VSocket, buf: &[u8], remote: IpEndpoint) -> isize {
        let nonblocking = vs.nonblocking;
        let timeout = vs.send_timeout;
        // An unbound UDP socket binds to an ephemeral port on first send
        {
            let Proto::Udp { handle, bound, .. } = &mut vs.proto else {
                return fail(Errno::ENOTSOCK) as isize;
            };
            if !*bound {
                let h = *handle;
                let ok = self.driver.core().with_state(|st| {
                    let port = st.ephemeral_port();
                    st.sockets
                        .get_mut::<udp::Socket>(h)
                        .bind(IpListenEndpoint::from(port))
                        .is_ok()
                });
                if !ok {
                    return fail(Errno::EADDRINUSE) as isize;
                }
                *bound = true;
            }
        }
        let res = self.block(nonblocking, timeout, Errno::EAGAIN, |st| {
            let Proto::Udp { handle, .. } = &vs.proto else {
                return Some(Err(Errno::ENOTSOCK));
            };
            let s = st.sockets.get_mut::<udp::Socket>(*handle);
            if !s.can_send() {
                return None;
            }
            match s.send_slice(buf, remote) {
                Ok(()) => Some(Ok(buf.len() as isize)),
                Err(udp::SendError::BufferFull) => None,
                Err(udp::SendError::Unaddressable) => Some(Err(Errno::ENETUNREACH)),
            }
        });
        flatten(res)
    }

    /// `recv(2)` / `read(2)`. A return of 0 means the remote performed an
    /// orderly shutdown.
    pub fn recv(&self, fd: i32, buf: &mut [u8]) -> isize {
        match self.recvfrom(fd, buf) {
            Ok((n, _)) => n,
            Err(e) => fail(e) as isize,
        }
    }

    /// `recvfrom(2)`. Also the implementation behind [`Self::recv`].
    #[allow(clippy::type_complexity)]
    pub fn recvfrom(&self, fd: i32, buf: &mut [u8]) -> Result<(isize, Option<SockAddr>), i32> {
        clear_errno();
        let entry = self.get(fd).ok_or_else(|| stamp(Errno::EBADF))?;
        let mut vs = entry.lock();
        if vs.recv_shutdown {
            return Ok((0, None));
        }
        let nonblocking = vs.nonblocking;
        let timeout = vs.recv_timeout;
        let res = match &vs.proto {
            Proto::Tcp { .. } => {
                let vs = &mut *vs;
                self.block(nonblocking, timeout, Errno::EAGAIN, |st| {
                    let Proto::Tcp { handle: Some(h), .. } = &vs.proto else {
                        return Some(Err(Errno::ENOTCONN));
                    };
                    let s = st.sockets.get_mut::<tcp::Socket>(*h);
                    if s.can_recv() {
                        return match s.recv_slice(buf) {
                            Ok(n) => Some(Ok((n as isize, None))),
                            Err(tcp::RecvError::Finished) => Some(Ok((0, None))),
                            Err(tcp::RecvError::InvalidState) => Some(Err(Errno::ENOTCONN)),
                        };
                    }
                    match s.state() {
                        // Remote closed and everything was drained
                        tcp::State::CloseWait
                        | tcp::State::Closed
                        | tcp::State::Closing
                        | tcp::State::LastAck
                        | tcp::State::TimeWait => Some(Ok((0, None))),
                        _ => None,
                    }
                })
            }
            Proto::Udp { .. } => {
                let vs = &mut *vs;
                self.block(nonblocking, timeout, Errno::EAGAIN, |st| {
                    let Proto::Udp { handle, remote, .. } = &vs.proto else {
                        return Some(Err(Errno::ENOTSOCK));
                    };
                    let s = st.sockets.get_mut::<udp::Socket>(*handle);
                    loop {
                        match s.recv_slice(buf) {
                            Ok((n, meta)) => {
                                // A connected UDP socket filters senders
                                if let Some(r) = remote {
                                    if meta.endpoint != *r {
                                        continue;
                                    }
                                }
                                return Some(Ok((
                                    n as isize,
                                    Some(std_endpoint(meta.endpoint)),
                                )));
                            }
                            Err(udp::RecvError::Exhausted) => return None,
                            Err(udp::RecvError::Truncated) => {
                                return Some(Err(Errno::EMSGSIZE))
                            }
                        }
                    }
                })
            }
            Proto::Icmp { .. } => return Err(stamp(Errno::EOPNOTSUPP)),
        };
        match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) | Err(e) => Err(stamp(e)),
        }
    }

    /// `shutdown(2)`.
    pub fn shutdown(&self, fd: i32, direction: i32) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        let mut vs = entry.lock();
        let Proto::Tcp { handle: Some(h), .. } = &vs.proto else {
            return fail(Errno::ENOTCONN);
        };
        let h = *h;
        match direction {
            how::SHUT_RD => vs.recv_shutdown = true,
            how::SHUT_WR => {
                self.driver
                    .core()
                    .with_state(|st| st.sockets.get_mut::<tcp::Socket>(h).close());
            }
            how::SHUT_RDWR => {
                vs.recv_shutdown = true;
                self.driver
                    .core()
                    .with_state(|st| st.sockets.get_mut::<tcp::Socket>(h).close());
            }
            _ => return fail(Errno::EINVAL),
        }
        0
    }

    // ------------------------------------------------------------------
    // Naming
    // ------------------------------------------------------------------

    /// `getsockname(2)`.
    pub fn getsockname(&self, fd: i32) -> Result<SockAddr, i32> {
        clear_errno();
        let entry = self.get(fd).ok_or_else(|| stamp(Errno::EBADF))?;
        let vs = entry.lock();
        let v6 = vs.family == AF_INET6;
        match &vs.proto {
            Proto::Tcp { handle: Some(h), local, .. } => {
                let h = *h;
                let ep = self
                    .driver
                    .core()
                    .with_state(|st| st.sockets.get::<tcp::Socket>(h).local_endpoint());
                Ok(ep
                    .map(std_endpoint)
                    .unwrap_or_else(|| unspec(v6, local.map(|l| l.port).unwrap_or(0))))
            }
            Proto::Tcp { local, .. } => Ok(local
                .map(|l| listen_to_std(l, v6))
                .unwrap_or_else(|| unspec(v6, 0))),
            Proto::Udp { handle, .. } => {
                let h = *handle;
                let ep = self
                    .driver
                    .core()
                    .with_state(|st| st.sockets.get::<udp::Socket>(h).endpoint());
                Ok(listen_to_std(ep, v6))
            }
            Proto::Icmp { .. } => Ok(unspec(v6, 0)),
        }
    }

    /// `getpeername(2)`.
    pub fn getpeername(&self, fd: i32) -> Result<SockAddr, i32> {
        clear_errno();
        let entry = self.get(fd).ok_or_else(|| stamp(Errno::EBADF))?;
        let vs = entry.lock();
        match &vs.proto {
            Proto::Tcp { handle: Some(h), .. } => {
                let h = *h;
                let ep = self
                    .driver
                    .core()
                    .with_state(|st| st.sockets.get::<tcp::Socket>(h).remote_endpoint());
                ep.map(std_endpoint).ok_or_else(|| stamp(Errno::ENOTCONN))
            }
            Proto::Udp { remote: Some(r), .. } => Ok(std_endpoint(*r)),
            _ => Err(stamp(Errno::ENOTCONN)),
        }
    }

    // ------------------------------------------------------------------
    // Options, flags, ioctls
    // ------------------------------------------------------------------

    /// Set the non-blocking flag directly (also reachable via fcntl).
    pub fn set_nonblocking(&self, fd: i32, nonblocking: bool) -> i32 {
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        entry.lock().nonblocking = nonblocking;
        0
    }

    /// Whether the socket is non-blocking.
    pub fn nonblocking(&self, fd: i32) -> Result<bool, i32> {
        let entry = self.get(fd).ok_or(Errno::EBADF)?;
        let nb = entry.lock().nonblocking;
        Ok(nb)
    }

    /// `fcntl(2)` subset: F_GETFL / F_SETFL with O_NONBLOCK.
    pub fn fcntl(&self, fd: i32, cmd: i32, flags: i32) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        match cmd {
            fcntl::F_GETFL => {
                if entry.lock().nonblocking {
                    fcntl::O_NONBLOCK
                } else {
                    0
                }
            }
            fcntl::F_SETFL => {
                entry.lock().nonblocking = flags & fcntl::O_NONBLOCK != 0;
                0
            }
            _ => fail(Errno::EINVAL),
        }
    }

    /// `ioctl(2)` subset: FIONREAD / FIONBIO.
    pub fn ioctl(&self, fd: i32, request: i64, arg: &mut i32) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        match request {
            ioctl::FIONBIO => {
                entry.lock().nonblocking = *arg != 0;
                0
            }
            ioctl::FIONREAD => {
                let vs = entry.lock();
                let n = match &vs.proto {
                    Proto::Tcp { handle: Some(h), .. } => {
                        let h = *h;
                        self.driver
                            .core()
                            .with_state(|st| st.sockets.get::<tcp::Socket>(h).recv_queue())
                    }
                    Proto::Udp { handle, .. } => {
                        let h = *handle;
                        self.driver.core().with_state(|st| {
                            st.sockets
                                .get_mut::<udp::Socket>(h)
                                .peek()
                                .map(|(payload, _)| payload.len())
                                .unwrap_or(0)
                        })
                    }
                    _ => 0,
                };
                *arg = n as i32;
                0
            }
            _ => fail(Errno::EINVAL),
        }
    }

    /// `setsockopt(2)` with an integer value. Timeval-style options take
    /// their value via [`Self::set_timeout_opt`].
    pub fn setsockopt_int(&self, fd: i32, level: i32, optname: i32, value: i32) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        let mut vs = entry.lock();
        match (level, optname) {
            (opt::SOL_SOCKET, opt::SO_KEEPALIVE) => {
                vs.keepalive = value != 0;
                let ka = vs.keepalive;
                self.for_tcp_handle(&vs, |s| {
                    s.set_keep_alive(ka.then(|| smoltcp::time::Duration::from_secs(75)));
                });
                0
            }
            (opt::SOL_SOCKET, opt::SO_LINGER) => {
                // Value is seconds; negative disables
                vs.linger = (value >= 0).then_some(value as u32);
                0
            }
            (opt::IPPROTO_TCP, opt::TCP_NODELAY) => {
                vs.nodelay = value != 0;
                let nagle = !vs.nodelay;
                self.for_tcp_handle(&vs, |s| s.set_nagle_enabled(nagle));
                0
            }
            (opt::IPPROTO_IP, opt::IP_TTL) => {
                if !(0..=255).contains(&value) {
                    return fail(Errno::EINVAL);
                }
                vs.ttl = value as u8;
                let ttl = vs.ttl;
                self.for_tcp_handle(&vs, |s| s.set_hop_limit(Some(ttl)));
                if let Proto::Udp { handle, .. } = &vs.proto {
                    let h = *handle;
                    self.driver.core().with_state(|st| {
                        st.sockets.get_mut::<udp::Socket>(h).set_hop_limit(Some(ttl))
                    });
                }
                0
            }
            // Accepted but not implemented: reads return the last set value
            (
                opt::SOL_SOCKET,
                opt::SO_DEBUG | opt::SO_OOBINLINE | opt::SO_DONTROUTE | opt::SO_USELOOPBACK
                | opt::SO_REUSEPORT | opt::SO_REUSEADDR | opt::SO_BROADCAST | opt::SO_SNDBUF
                | opt::SO_RCVBUF | opt::SO_SNDLOWAT | opt::SO_RCVLOWAT,
            ) => {
                vs.raw_opts.insert((level, optname), value);
                0
            }
            _ => fail(Errno::EINVAL),
        }
    }

    /// `getsockopt(2)` for integer-valued options.
    pub fn getsockopt_int(&self, fd: i32, level: i32, optname: i32) -> Result<i32, i32> {
        clear_errno();
        let entry = self.get(fd).ok_or_else(|| stamp(Errno::EBADF))?;
        let mut vs = entry.lock();
        let v = match (level, optname) {
            (opt::SOL_SOCKET, opt::SO_KEEPALIVE) => vs.keepalive as i32,
            (opt::SOL_SOCKET, opt::SO_LINGER) => vs.linger.map(|s| s as i32).unwrap_or(-1),
            (opt::SOL_SOCKET, opt::SO_TYPE) => vs.kind,
            (opt::SOL_SOCKET, opt::SO_ERROR) => {
                let e = self.current_so_error(&mut vs);
                vs.so_error = 0;
                e
            }
            (opt::SOL_SOCKET, opt::SO_ACCEPTCONN) => {
                matches!(&vs.proto, Proto::Tcp { listen: Some(_), .. }) as i32
            }
            (opt::IPPROTO_TCP, opt::TCP_NODELAY) => vs.nodelay as i32,
            (opt::IPPROTO_IP, opt::IP_TTL) => vs.ttl as i32,
            _ => *vs
                .raw_opts
                .get(&(level, optname))
                .ok_or_else(|| stamp(Errno::EINVAL))?,
        };
        Ok(v)
    }

    /// SO_RCVTIMEO / SO_SNDTIMEO, taking the classic timeval split of
    /// seconds plus microseconds.
    pub fn set_timeout_opt(&self, fd: i32, optname: i32, seconds: i64, micros: i64) -> i32 {
        clear_errno();
        let Some(entry) = self.get(fd) else { return fail(Errno::EBADF) };
        if seconds < 0 || micros < 0 {
            return fail(Errno::EINVAL);
        }
        let t = Duration::from_secs(seconds as u64) + Duration::from_micros(micros as u64);
        let t = (!t.is_zero()).then_some(t);
        let mut vs = entry.lock();
        match optname {
            opt::SO_RCVTIMEO => vs.recv_timeout = t,
            opt::SO_SNDTIMEO => vs.send_timeout = t,
            _ => return fail(Errno::EINVAL),
        }
        0
    }

    /// Read back a timeout option as (seconds, microseconds).
    pub fn timeout_opt(&self, fd: i32, optname: i32) -> Result<(i64, i64), i32> {
        let entry = self.get(fd).ok_or(Errno::EBADF)?;
        let vs = entry.lock();
        let t = match optname {
            opt::SO_RCVTIMEO => vs.recv_timeout,
            opt::SO_SNDTIMEO => vs.send_timeout,
            _ => return Err(Errno::EINVAL),
        };
        Ok(t.map(|d| (d.as_secs() as i64, d.subsec_micros() as i64))
            .unwrap_or((0, 0)))
    }

    // ------------------------------------------------------------------
    // Readiness: select / poll
    // ------------------------------------------------------------------

    /// `select(2)`-alike over fd sets. Returns the number of ready
    /// descriptors, pruning the sets in place.
    pub fn select(
        &self,
        readfds: Option<&mut FdSet>,
        writefds: Option<&mut FdSet>,
        exceptfds: Option<&mut FdSet>,
        timeout: Option<Duration>,
    ) -> i32 {
        clear_errno();
        let deadline = timeout.map(|t| StdInstant::now() + t);
        let rset: Vec<i32> = readfds.as_ref().map(|s| s.iter().collect()).unwrap_or_default();
        let wset: Vec<i32> = writefds.as_ref().map(|s| s.iter().collect()).unwrap_or_default();

        let mut ready_r: Vec<i32> = Vec::new();
        let mut ready_w: Vec<i32> = Vec::new();
        loop {
            ready_r.clear();
            ready_w.clear();
            {
                let core = self.driver.core();
                let mut st = core.state.lock();
                for fd in &rset {
                    if self.is_readable(*fd, &st) {
                        ready_r.push(*fd);
                    }
                }
                for fd in &wset {
                    if self.is_writable(*fd, &st) {
                        ready_w.push(*fd);
                    }
                }
                if ready_r.is_empty() && ready_w.is_empty() {
                    match wait_slice(deadline) {
                        Some(wait) => {
                            core.wake.wait_for(&mut st, wait);
                            continue;
                        }
                        None => {
                            drop(st);
                            if let Some(s) = readfds {
                                s.zero();
                            }
                            if let Some(s) = writefds {
                                s.zero();
                            }
                            if let Some(s) = exceptfds {
                                s.zero();
                            }
                            return 0;
                        }
                    }
                }
            }
            break;
        }
        if let Some(s) = readfds {
            s.retain(&ready_r);
        }
        if let Some(s) = writefds {
            s.retain(&ready_w);
        }
        if let Some(s) = exceptfds {
            s.zero();
        }
        (ready_r.len() + ready_w.len()) as i32
    }

    /// `poll(2)`-alike. Fills `revents`, returns the count of fds with
    /// any event.
    pub fn poll(&self, fds: &mut [PollFd], timeout: Option<Duration>) -> i32 {
        clear_errno();
        let deadline = timeout.map(|t| StdInstant::now() + t);
        loop {
            let mut ready = 0;
            {
                let core = self.driver.core();
                let mut st = core.state.lock();
                for p in fds.iter_mut() {
                    p.revents = PollEvents::empty();
                    if self.get(p.fd).is_none() {
                        p.revents |= PollEvents::NVAL;
                    } else {
                        if p.events.contains(PollEvents::IN) && self.is_readable(p.fd, &st) {
                            p.revents |= PollEvents::IN;
                        }
                        if p.events.contains(PollEvents::OUT) && self.is_writable(p.fd, &st) {
                            p.revents |= PollEvents::OUT;
                        }
                    }
                    if !p.revents.is_empty() {
                        ready += 1;
                    }
                }
                if ready == 0 {
                    match wait_slice(deadline) {
                        Some(wait) => {
                            core.wake.wait_for(&mut st, wait);
                            continue;
                        }
                        None => return 0,
                    }
                }
            }
            return ready;
        }
    }

    /// Readiness check; runs with the core lock held, so the socket is
    /// only try-locked (a socket busy in another call counts as not
    /// ready this round).
    fn is_readable(&self, fd: i32, st: &CoreState) -> bool {
        let Some(entry) = self.get(fd) else { return false };
        let Some(vs) = entry.try_lock() else { return false };
        if vs.recv_shutdown {
            return true;
        }
        match &vs.proto {
            Proto::Tcp { listen: Some(l), .. } => l.pool.iter().any(|h| {
                matches!(
                    st.sockets.get::<tcp::Socket>(*h).state(),
                    tcp::State::Established | tcp::State::CloseWait
                )
            }),
            Proto::Tcp { handle: Some(h), .. } => {
                let s = st.sockets.get::<tcp::Socket>(*h);
                s.can_recv()
                    || matches!(
                        s.state(),
                        tcp::State::CloseWait | tcp::State::Closed | tcp::State::TimeWait
                    )
            }
            Proto::Tcp { .. } => false,
            Proto::Udp { handle, .. } => st.sockets.get::<udp::Socket>(*handle).can_recv(),
            Proto::Icmp { handle } => st.sockets.get::<icmp::Socket>(*handle).can_recv(),
        }
    }

    fn is_writable(&self, fd: i32, st: &CoreState) -> bool {
        let Some(entry) = self.get(fd) else { return false };
        let Some(vs) = entry.try_lock() else { return false };
        match &vs.proto {
            Proto::Tcp { handle: Some(h), connecting, .. } => {
                let s = st.sockets.get::<tcp::Socket>(*h);
                match s.state() {
                    tcp::State::Established | tcp::State::CloseWait => s.can_send(),
                    // A failed non-blocking connect reports writable so
                    // select() callers go on to read SO_ERROR
                    tcp::State::Closed => *connecting,
                    _ => false,
                }
            }
            Proto::Udp { handle, .. } => st.sockets.get::<udp::Socket>(*handle).can_send(),
            _ => false,
        }
    }

    fn current_so_error(&self, vs: &mut VSocket) -> i32 {
        // Refresh from the live socket for in-flight connects
        if let Proto::Tcp { handle: Some(h), connecting: true, .. } = &vs.proto {
            let h = *h;
            let state = self
                .driver
                .core()
                .with_state(|st| st.sockets.get::<tcp::Socket>(h).state());
            match state {
                tcp::State::Established => {
                    if let Proto::Tcp { connecting, .. } = &mut vs.proto {
                        *connecting = false;
                    }
                    vs.so_error = 0;
                }
                tcp::State::Closed => {
                    if let Proto::Tcp { connecting, .. } = &mut vs.proto {
                        *connecting = false;
                    }
                    vs.so_error = Errno::ECONNREFUSED;
                }
                _ => {}
            }
        }
        vs.so_error
    }

    // ------------------------------------------------------------------
    // DNS registration (resolution itself is out of scope)
    // ------------------------------------------------------------------

    /// Register a nameserver for this stack (at most two are kept).
    pub fn add_nameserver(&self, addr: SockAddr) -> i32 {
        let mut ns = self.nameservers.lock();
        if ns.contains(&addr) {
            return 0;
        }
        if ns.len() >= 2 {
            return fail(Errno::ENOMEM);
        }
        ns.push(addr);
        0
    }

    /// Remove a registered nameserver.
    pub fn del_nameserver(&self, addr: SockAddr) -> i32 {
        let mut ns = self.nameservers.lock();
        let before = ns.len();
        ns.retain(|a| *a != addr);
        if ns.len() == before {
            fail(Errno::EINVAL)
        } else {
            0
        }
    }

    /// Registered nameservers, in registration order.
    pub fn nameservers(&self) -> Vec<SockAddr> {
        self.nameservers.lock().clone()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn for_tcp_handle(&self, vs: &VSocket, f: impl FnOnce(&mut tcp::Socket)) {
        if let Proto::Tcp { handle: Some(h), .. } = &vs.proto {
            let h = *h;
            self.driver
                .core()
                .with_state(|st| f(st.sockets.get_mut::<tcp::Socket>(h)));
        }
    }

    /// Run `f` under the core lock until it yields, the socket would
    /// block, or the timeout passes. The caller holds its socket's mutex
    /// for the duration; only the core lock is released while waiting.
    fn block<R>(
        &self,
        nonblocking: bool,
        timeout: Option<Duration>,
        timeout_errno: i32,
        mut f: impl FnMut(&mut CoreState) -> Option<R>,
    ) -> Result<R, i32> {
        let deadline = timeout.map(|t| StdInstant::now() + t);
        let core = self.driver.core();
        let mut st = core.state.lock();
        loop {
            if st.phase != StackPhase::Running {
                return Err(Errno::ENETDOWN);
            }
            if let Some(r) = f(&mut st) {
                drop(st);
                core.poll_wake.notify_all();
                return Ok(r);
            }
            if nonblocking {
                return Err(Errno::EAGAIN);
            }
            match wait_slice(deadline) {
                Some(wait) => {
                    core.wake.wait_for(&mut st, wait);
                }
                None => return Err(timeout_errno),
            }
        }
    }

    /// Like [`Self::block`] but without a socket context (used by close's
    /// linger wait).
    fn wait_on_core<R>(
        &self,
        timeout: Option<Duration>,
        timeout_errno: i32,
        f: impl FnMut(&mut CoreState) -> Option<R>,
    ) -> Result<R, i32> {
        self.block(false, timeout, timeout_errno, f)
    }
}

/// Remaining wait slice before `deadline`, or `None` once it has passed.
fn wait_slice(deadline: Option<StdInstant>) -> Option<Duration> {
    match deadline {
        Some(d) => {
            let now = StdInstant::now();
            if now >= d {
                None
            } else {
                Some(d.saturating_duration_since(now).min(WAIT_SLICE))
            }
        }
        None => Some(WAIT_SLICE),
    }
}

/// A set of descriptors for [`SocketLayer::select`].
#[derive(Debug, Clone, Default)]
pub struct FdSet {
    bits: HashSet<i32>,
}

#[allow(missing_docs)]
impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set(&mut self, fd: i32) {
        self.bits.insert(fd);
    }
    pub fn clear(&mut self, fd: i32) {
        self.bits.remove(&fd);
    }
    pub fn is_set(&self, fd: i32) -> bool {
        self.bits.contains(&fd)
    }
    pub fn zero(&mut self) {
        self.bits.clear();
    }
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.bits.iter().copied()
    }
    fn retain(&mut self, keep: &[i32]) {
        self.bits.retain(|fd| keep.contains(fd));
    }
}

/// Event mask for [`SocketLayer::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollEvents(pub u16);

#[allow(missing_docs)]
impl PollEvents {
    pub const IN: PollEvents = PollEvents(0x001);
    pub const OUT: PollEvents = PollEvents(0x004);
    pub const ERR: PollEvents = PollEvents(0x008);
    pub const HUP: PollEvents = PollEvents(0x010);
    pub const NVAL: PollEvents = PollEvents(0x020);

    pub fn empty() -> Self {
        PollEvents(0)
    }
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
    pub fn contains(&self, other: PollEvents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PollEvents {
    type Output = PollEvents;
    fn bitor(self, rhs: PollEvents) -> PollEvents {
        PollEvents(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PollEvents {
    fn bitor_assign(&mut self, rhs: PollEvents) {
        self.0 |= rhs.0;
    }
}

/// One entry for [`SocketLayer::poll`].
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: i32,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl PollFd {
    pub fn new(fd: i32, events: PollEvents) -> Self {
        Self { fd, events, revents: PollEvents::empty() }
    }
}

fn fail(errno: i32) -> i32 {
    set_errno(errno);
    -1
}

fn stamp(errno: i32) -> i32 {
    set_errno(errno);
    errno
}

fn flatten(res: Result<Result<isize, i32>, i32>) -> isize {
    match res {
        Ok(Ok(n)) => n,
        Ok(Err(e)) | Err(e) => fail(e) as isize,
    }
}

fn unspec(v6: bool, port: u16) -> SockAddr {
    if v6 {
        SocketAddr::from(([0u16; 8], port))
    } else {
        SocketAddr::from(([0u8; 4], port))
    }
}

fn family_matches(family: i32, addr: &SockAddr) -> bool {
    (family == AF_INET && addr.is_ipv4()) || (family == AF_INET6 && addr.is_ipv6())
}

fn ip_endpoint(addr: SockAddr) -> IpEndpoint {
    IpEndpoint::new(to_smol_ip(addr.ip()), addr.port())
}

fn listen_endpoint(ip: IpAddr, port: u16) -> IpListenEndpoint {
    let unspecified = match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    };
    IpListenEndpoint {
        addr: (!unspecified).then(|| to_smol_ip(ip)),
        port,
    }
}

fn std_endpoint(ep: IpEndpoint) -> SockAddr {
    SocketAddr::new(from_smol_ip(ep.addr), ep.port)
}

fn listen_to_std(ep: IpListenEndpoint, v6: bool) -> SockAddr {
    match ep.addr {
        Some(addr) => SocketAddr::new(from_smol_ip(addr), ep.port),
        None => unspec(v6, ep.port),
    }
}

fn new_listening_socket(st: &mut CoreState, endpoint: IpListenEndpoint) -> Option<SocketHandle> {
    let mut socket = tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
        tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
    );
    socket.listen(endpoint).ok()?;
    Some(st.sockets.add(socket))
}

/// Choose the netif whose addresses can reach `dest`: first a netif whose
/// assigned prefix contains it, then one with an address of the same
/// family, then none.
fn pick_netif(st: &CoreState, dest: IpAddr) -> Option<NetifId> {
    let mut same_family: Option<NetifId> = None;
    for (id, netif) in st.netifs.iter() {
        if !netif.up {
            continue;
        }
        for cidr in netif.iface.ip_addrs() {
            let addr = from_smol_ip(cidr.address());
            if addr.is_ipv4() != dest.is_ipv4() {
                continue;
            }
            if cidr_contains((addr, cidr.prefix_len()), &dest) {
                return Some(*id);
            }
            if same_family.is_none() {
                same_family = Some(*id);
            }
        }
    }
    same_family
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::device::FrameSink;
    use crate::driver::StackDriver;
    use zerolink_core::{Mac, NetworkId};

    struct NullSink;
    impl FrameSink for NullSink {
        fn transmit(&self, _frame: &[u8]) {}
    }

    fn layer() -> SocketLayer {
        let driver = StackDriver::start_unmanaged(Arc::new(|_| {}));
        assert!(driver.wait_running(Duration::from_secs(5)));
        let id = driver
            .add_netif(
                NetworkId(0xe5cd7a9e1c000001),
                Mac([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]),
                2800,
                Arc::new(NullSink),
            )
            .unwrap();
        driver.add_ip(id, "10.7.0.5".parse().unwrap(), 16).unwrap();
        SocketLayer::new(driver)
    }

    #[test]
    fn fds_are_unique_and_reusable() {
        let sl = layer();
        let a = sl.socket(AF_INET, SOCK_STREAM, 0);
        let b = sl.socket(AF_INET, SOCK_DGRAM, 0);
        assert!(a >= 0 && b >= 0 && a != b);
        assert_eq!(sl.close(a), 0);
        let c = sl.socket(AF_INET6, SOCK_STREAM, 0);
        assert_eq!(c, a, "closed fd is reused");
        assert_eq!(sl.close(b), 0);
        assert_eq!(sl.close(c), 0);
        assert_eq!(sl.open_count(), 0);
    }

    #[test]
    fn bad_family_and_bad_fd() {
        let sl = layer();
        assert_eq!(sl.socket(99, SOCK_STREAM, 0), -1);
        assert_eq!(crate::errno::errno(), Errno::EAFNOSUPPORT);
        assert_eq!(sl.close(1234), -1);
        assert_eq!(crate::errno::errno(), Errno::EBADF);
    }

    #[test]
    fn listen_requires_bind() {
        let sl = layer();
        let fd = sl.socket(AF_INET, SOCK_STREAM, 0);
        assert_eq!(sl.listen(fd, 0), -1);
        assert_eq!(crate::errno::errno(), Errno::EDESTADDRREQ);
        assert_eq!(sl.bind(fd, "0.0.0.0:8442".parse().unwrap()), 0);
        assert_eq!(sl.listen(fd, 1), 0);
        sl.close(fd);
    }

    #[test]
    fn double_bind_same_port_fails() {
        let sl = layer();
        let a = sl.socket(AF_INET, SOCK_STREAM, 0);
        let b = sl.socket(AF_INET, SOCK_STREAM, 0);
        assert_eq!(sl.bind(a, "0.0.0.0:8443".parse().unwrap()), 0);
        assert_eq!(sl.bind(b, "0.0.0.0:8443".parse().unwrap()), -1);
        assert_eq!(crate::errno::errno(), Errno::EADDRINUSE);
        sl.close(a);
        // After close the port is free again
        assert_eq!(sl.bind(b, "0.0.0.0:8443".parse().unwrap()), 0);
        sl.close(b);
    }

    #[test]
    fn sockopt_round_trips() {
        let sl = layer();
        let fd = sl.socket(AF_INET, SOCK_STREAM, 0);

        assert_eq!(sl.setsockopt_int(fd, opt::IPPROTO_TCP, opt::TCP_NODELAY, 1), 0);
        assert_eq!(sl.getsockopt_int(fd, opt::IPPROTO_TCP, opt::TCP_NODELAY).unwrap(), 1);

        assert_eq!(sl.setsockopt_int(fd, opt::IPPROTO_IP, opt::IP_TTL, 64), 0);
        assert_eq!(sl.getsockopt_int(fd, opt::IPPROTO_IP, opt::IP_TTL).unwrap(), 64);
        // Default TTL is 255
        let fd2 = sl.socket(AF_INET, SOCK_STREAM, 0);
        assert_eq!(sl.getsockopt_int(fd2, opt::IPPROTO_IP, opt::IP_TTL).unwrap(), 255);

        assert_eq!(sl.setsockopt_int(fd, opt::SOL_SOCKET, opt::SO_KEEPALIVE, 1), 0);
        assert_eq!(sl.getsockopt_int(fd, opt::SOL_SOCKET, opt::SO_KEEPALIVE).unwrap(), 1);

        assert_eq!(sl.setsockopt_int(fd, opt::SOL_SOCKET, opt::SO_LINGER, 7), 0);
        assert_eq!(sl.getsockopt_int(fd, opt::SOL_SOCKET, opt::SO_LINGER).unwrap(), 7);

        // Timeval conversion: 1.5 s survives the round trip
        assert_eq!(sl.set_timeout_opt(fd, opt::SO_RCVTIMEO, 1, 500_000), 0);
        assert_eq!(sl.timeout_opt(fd, opt::SO_RCVTIMEO).unwrap(), (1, 500_000));

        // Accepted-but-unimplemented options echo the stored value
        assert_eq!(sl.setsockopt_int(fd, opt::SOL_SOCKET, opt::SO_SNDBUF, 4096), 0);
        assert_eq!(sl.getsockopt_int(fd, opt::SOL_SOCKET, opt::SO_SNDBUF).unwrap(), 4096);

        assert_eq!(sl.getsockopt_int(fd, opt::SOL_SOCKET, opt::SO_TYPE).unwrap(), SOCK_STREAM);
        sl.close(fd);
        sl.close(fd2);
    }

    #[test]
    fn nonblocking_flag_via_fcntl_and_ioctl() {
        let sl = layer();
        let fd = sl.socket(AF_INET, SOCK_DGRAM, 0);
        assert_eq!(sl.fcntl(fd, fcntl::F_GETFL, 0), 0);
        assert_eq!(sl.fcntl(fd, fcntl::F_SETFL, fcntl::O_NONBLOCK), 0);
        assert_eq!(sl.fcntl(fd, fcntl::F_GETFL, 0), fcntl::O_NONBLOCK);
        let mut off = 0;
        assert_eq!(sl.ioctl(fd, ioctl::FIONBIO, &mut off), 0);
        assert!(!sl.nonblocking(fd).unwrap());
        sl.close(fd);
    }

    #[test]
    fn nonblocking_recv_is_eagain() {
        let sl = layer();
        let fd = sl.socket(AF_INET, SOCK_DGRAM, 0);
        assert_eq!(sl.bind(fd, "0.0.0.0:9000".parse().unwrap()), 0);
        sl.set_nonblocking(fd, true);
        let mut buf = [0u8; 64];
        assert_eq!(sl.recv(fd, &mut buf), -1);
        assert_eq!(crate::errno::errno(), Errno::EAGAIN);
        sl.close(fd);
    }

    #[test]
    fn recv_timeout_expires_with_eagain() {
        let sl = layer();
        let fd = sl.socket(AF_INET, SOCK_DGRAM, 0);
        assert_eq!(sl.bind(fd, "0.0.0.0:9001".parse().unwrap()), 0);
        assert_eq!(sl.set_timeout_opt(fd, opt::SO_RCVTIMEO, 0, 200_000), 0);
        let started = StdInstant::now();
        let mut buf = [0u8; 64];
        assert_eq!(sl.recv(fd, &mut buf), -1);
        assert_eq!(crate::errno::errno(), Errno::EAGAIN);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(800));
        sl.close(fd);
    }

    #[test]
    fn send_without_destination_fails() {
        let sl = layer();
        let fd = sl.socket(AF_INET, SOCK_DGRAM, 0);
        assert_eq!(sl.send(fd, b"x"), -1);
        assert_eq!(crate::errno::errno(), Errno::EDESTADDRREQ);
        sl.close(fd);
    }

    #[test]
    fn udp_connect_sets_peer() {
        let sl = layer();
        let fd = sl.socket(AF_INET, SOCK_DGRAM, 0);
        let peer: SockAddr = "10.7.0.99:4000".parse().unwrap();
        assert_eq!(sl.connect(fd, peer), 0);
        assert_eq!(sl.getpeername(fd).unwrap(), peer);
        sl.close(fd);
    }

    #[test]
    fn select_times_out_empty() {
        let sl = layer();
        let fd = sl.socket(AF_INET, SOCK_DGRAM, 0);
        sl.bind(fd, "0.0.0.0:9002".parse().unwrap());
        let mut read = FdSet::new();
        read.set(fd);
        let n = sl.select(Some(&mut read), None, None, Some(Duration::from_millis(100)));
        assert_eq!(n, 0);
        assert!(!read.is_set(fd));
        sl.close(fd);
    }

    #[test]
    fn poll_reports_nval_for_bad_fd() {
        let sl = layer();
        let mut fds = [PollFd::new(555, PollEvents::IN)];
        let n = sl.poll(&mut fds, Some(Duration::from_millis(10)));
        assert_eq!(n, 1);
        assert!(fds[0].revents.contains(PollEvents::NVAL));
    }

    #[test]
    fn nameserver_registry() {
        let sl = layer();
        let a: SockAddr = "10.7.0.1:53".parse().unwrap();
        let b: SockAddr = "10.7.0.2:53".parse().unwrap();
        let c: SockAddr = "10.7.0.3:53".parse().unwrap();
        assert_eq!(sl.add_nameserver(a), 0);
        assert_eq!(sl.add_nameserver(b), 0);
        assert_eq!(sl.add_nameserver(c), -1);
        assert_eq!(sl.nameservers(), vec![a, b]);
        assert_eq!(sl.del_nameserver(a), 0);
        assert_eq!(sl.del_nameserver(c), -1);
    }

    #[test]
    fn tcp_echo_across_two_netifs() {
        // Two netifs on one driver, cross-wired like two hosts on a
        // shared segment: everything one transmits, the other receives.
        // The listening socket lives in the shared socket set; the
        // client connects from the first netif's address to the second's
        // and the whole handshake runs through ARP and TCP for real.
        use std::collections::VecDeque;
        use std::sync::atomic::AtomicBool;

        struct QueueSink(Arc<PlMutex<VecDeque<Vec<u8>>>>);
        impl FrameSink for QueueSink {
            fn transmit(&self, frame: &[u8]) {
                self.0.lock().push_back(frame.to_vec());
            }
        }

        let driver = StackDriver::start_unmanaged(Arc::new(|_| {}));
        assert!(driver.wait_running(Duration::from_secs(5)));
        let a_tx: Arc<PlMutex<VecDeque<Vec<u8>>>> = Arc::new(PlMutex::new(VecDeque::new()));
        let b_tx: Arc<PlMutex<VecDeque<Vec<u8>>>> = Arc::new(PlMutex::new(VecDeque::new()));
        let nwid = NetworkId(0xe5cd7a9e1c000001);
        let a = driver
            .add_netif(nwid, Mac([0x02, 0, 0, 0, 0, 0xaa]), 2800, Arc::new(QueueSink(a_tx.clone())))
            .unwrap();
        let b = driver
            .add_netif(nwid, Mac([0x02, 0, 0, 0, 0, 0xbb]), 2800, Arc::new(QueueSink(b_tx.clone())))
            .unwrap();
        driver.add_ip(a, "10.7.0.5".parse().unwrap(), 16).unwrap();
        driver.add_ip(b, "10.7.0.6".parse().unwrap(), 16).unwrap();

        // Cross-pump from a separate thread; the sinks run under the
        // core lock and must not reinject themselves.
        let stop = Arc::new(AtomicBool::new(false));
        let pump = {
            let driver = driver.clone();
            let (a_tx, b_tx, stop) = (a_tx.clone(), b_tx.clone(), stop.clone());
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let mut moved = false;
                    while let Some(f) = a_tx.lock().pop_front() {
                        driver.inject_frame(b, f);
                        moved = true;
                    }
                    while let Some(f) = b_tx.lock().pop_front() {
                        driver.inject_frame(a, f);
                        moved = true;
                    }
                    if !moved {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };

        let sl = Arc::new(SocketLayer::new(driver));
        let server = sl.socket(AF_INET, SOCK_STREAM, 0);
        assert_eq!(sl.bind(server, "10.7.0.6:8442".parse().unwrap()), 0);
        assert_eq!(sl.listen(server, 1), 0);

        let sl2 = sl.clone();
        let client_thread = std::thread::spawn(move || {
            let client = sl2.socket(AF_INET, SOCK_STREAM, 0);
            let rc = sl2.connect_timeout(
                client,
                "10.7.0.6:8442".parse().unwrap(),
                Duration::from_secs(10),
            );
            assert_eq!(rc, 0, "connect failed with errno {}", crate::errno::errno());
            assert_eq!(sl2.send(client, b"welcome to the machine"), 22);
            let mut buf = [0u8; 128];
            let n = sl2.recv(client, &mut buf);
            assert_eq!(n, 22);
            assert_eq!(&buf[..22], b"welcome to the machine");
            sl2.close(client);
        });

        let conn = sl.accept(server);
        assert!(conn >= 0, "accept failed with errno {}", crate::errno::errno());
        let mut buf = [0u8; 128];
        let n = sl.recv(conn, &mut buf);
        assert_eq!(n, 22);
        assert_eq!(sl.send(conn, &buf[..n as usize]), 22);
        client_thread.join().unwrap();
        sl.close(conn);
        sl.close(server);
        stop.store(true, Ordering::Relaxed);
        pump.join().unwrap();
    }
}
