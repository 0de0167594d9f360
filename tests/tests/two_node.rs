//! Two in-process nodes talking over loopback UDP: handshake, ad-hoc
//! network membership, and TCP over the virtual interfaces.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zerolink_core::ipv6::rfc4193_addr;
use zerolink_core::{Mac, MulticastGroup, NetworkId, ServiceConfig};
use zerolink_integration_tests::{init_tracing, wait_for};
use zerolink_service::binder::find_usable_port;
use zerolink_service::Service;
use zerolink_stack::errno::{errno, Errno};
use zerolink_stack::sockets::{fcntl, opt};
use zerolink_stack::{FdSet, AF_INET6, SOCK_STREAM};

const ECHO_PORT: u16 = 8442;

fn start_node(port: u16) -> Arc<Service> {
    let config = ServiceConfig::default()
        .with_explicit_bind(SocketAddr::from(([127, 0, 0, 1], port)));
    Service::start_unmanaged(config, None).expect("service start")
}

#[test]
fn adhoc_ipv6_tcp_echo_and_readiness() {
    init_tracing();

    let port_a = find_usable_port(45100).expect("port a");
    let port_b = find_usable_port(port_a + 1).expect("port b");
    let a = start_node(port_a);
    let b = start_node(port_b);

    // Static first-contact hints, as an embedder with known peers would
    // configure them
    a.add_peer_hint(b.node_id(), SocketAddr::from(([127, 0, 0, 1], port_b)));
    b.add_peer_hint(a.node_id(), SocketAddr::from(([127, 0, 0, 1], port_a)));

    assert!(wait_for(10, || a.is_ready()), "node a not ready");
    assert!(wait_for(10, || b.is_ready()), "node b not ready");

    let nwid = NetworkId::adhoc(ECHO_PORT, ECHO_PORT);
    a.join(nwid).expect("a join");
    b.join(nwid).expect("b join");
    assert!(wait_for(10, || {
        a.network_info(nwid).map(|i| i.has_ipv6()).unwrap_or(false)
            && b.network_info(nwid).map(|i| i.has_ipv6()).unwrap_or(false)
    }));

    // Application-chosen multicast groups can be registered manually on
    // top of the address-derived ones the orchestrator maintains
    let group = MulticastGroup { mac: Mac([0x33, 0x33, 0, 0, 0, 0xfb]), adi: 0 };
    a.multicast_subscribe(nwid, group).expect("subscribe");
    a.multicast_unsubscribe(nwid, group).expect("unsubscribe");

    let b_addr = SocketAddr::new(IpAddr::V6(rfc4193_addr(nwid, b.node_id())), ECHO_PORT);

    // Server on b
    let server = b.sockets().socket(AF_INET6, SOCK_STREAM, 0);
    assert!(server >= 0);
    assert_eq!(
        b.sockets().bind(server, SocketAddr::new("::".parse().unwrap(), ECHO_PORT)),
        0
    );
    assert_eq!(b.sockets().listen(server, 2), 0);
    // Bound the accepts so a broken handshake fails the test instead of
    // hanging it
    assert_eq!(b.sockets().set_timeout_opt(server, opt::SO_RCVTIMEO, 60, 0), 0);

    let b2 = b.clone();
    let echo_thread = std::thread::spawn(move || {
        // First connection: echo 22 bytes
        let conn = b2.sockets().accept(server);
        assert!(conn >= 0, "accept failed, errno {}", errno());
        let mut buf = [0u8; 128];
        let n = b2.sockets().recv(conn, &mut buf);
        assert_eq!(n, 22);
        assert_eq!(b2.sockets().send(conn, &buf[..n as usize]), 22);
        // Keep the connection open for the recv-timeout scenario below;
        // the second accept serves the non-blocking connect
        let conn2 = b2.sockets().accept(server);
        assert!(conn2 >= 0);
        (conn, conn2)
    });

    // Client on a: blocking connect with a generous first-contact window
    let client = a.sockets().socket(AF_INET6, SOCK_STREAM, 0);
    assert!(client >= 0);
    let rc = a
        .sockets()
        .connect_timeout(client, b_addr, Duration::from_secs(20));
    assert_eq!(rc, 0, "connect failed, errno {}", errno());

    // getpeername reflects the connected address
    assert_eq!(a.sockets().getpeername(client).expect("peername"), b_addr);

    let payload = b"welcome to the machine";
    assert_eq!(a.sockets().send(client, payload), 22);
    let mut buf = [0u8; 128];
    let n = a.sockets().recv(client, &mut buf);
    assert_eq!(n, 22);
    assert_eq!(&buf[..22], payload);

    // Non-blocking connect: EINPROGRESS, then select-for-write, then a
    // clean SO_ERROR
    let nb = a.sockets().socket(AF_INET6, SOCK_STREAM, 0);
    assert_eq!(a.sockets().fcntl(nb, fcntl::F_SETFL, fcntl::O_NONBLOCK), 0);
    assert_eq!(a.sockets().connect(nb, b_addr), -1);
    assert_eq!(errno(), Errno::EINPROGRESS);
    let mut wset = FdSet::new();
    wset.set(nb);
    let ready = a
        .sockets()
        .select(None, Some(&mut wset), None, Some(Duration::from_secs(5)));
    assert_eq!(ready, 1, "socket never became writable");
    assert!(wset.is_set(nb));
    assert_eq!(
        a.sockets().getsockopt_int(nb, opt::SOL_SOCKET, opt::SO_ERROR).expect("so_error"),
        0
    );

    let (conn, conn2) = echo_thread.join().expect("echo thread");

    // Receive timeout on an idle connected socket: one second, reported
    // as EAGAIN, within the documented window
    assert_eq!(a.sockets().set_timeout_opt(client, opt::SO_RCVTIMEO, 1, 0), 0);
    let started = Instant::now();
    assert_eq!(a.sockets().recv(client, &mut buf), -1);
    assert_eq!(errno(), Errno::EAGAIN);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(950), "returned too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1800), "returned too late: {elapsed:?}");

    // Peers learned each other directly
    assert!(a.peers().iter().any(|p| p.address == b.node_id()));
    assert!(b.peers().iter().any(|p| p.address == a.node_id()));

    for fd in [client, nb] {
        a.sockets().close(fd);
    }
    for fd in [conn, conn2, server] {
        b.sockets().close(fd);
    }
    a.stop();
    b.stop();
}
