//! Service lifecycle through the public surface: one start per process,
//! stop, terminal free, refused restart.

use std::net::SocketAddr;

use zerolink_core::{Event, ReturnCode, ServiceConfig};
use zerolink_integration_tests::{init_tracing, wait_for, EventLog};
use zerolink_sdk as zl;
use zerolink_service::binder::find_usable_port;

#[test]
fn full_lifecycle_and_restart_refusal() {
    init_tracing();

    // Before any start, every socket call fails fast with the service
    // code and touches nothing.
    assert_eq!(zl::socket(zl::AF_INET, zl::SOCK_STREAM, 0), ReturnCode::Service as i32);
    assert!(!zl::node_online());

    let home = tempfile::tempdir().expect("tempdir");
    let port = find_usable_port(44400).expect("port");
    let log = EventLog::new();
    let config = ServiceConfig::default()
        .with_home(home.path())
        .with_explicit_bind(SocketAddr::from(([127, 0, 0, 1], port)));

    assert_eq!(zl::start(config.clone(), Some(log.clone())), 0);
    // Double start while running is an invalid operation
    assert_eq!(zl::start(config.clone(), None), ReturnCode::Service as i32);

    assert!(wait_for(10, zl::ready), "service never became ready");
    let node = zl::node_id().expect("node id");
    assert!(node.is_valid());

    // Identity and auth token were persisted with the documented names
    assert!(home.path().join("identity.secret").exists());
    assert!(home.path().join("identity.public").exists());
    assert!(home.path().join("authtoken.secret").exists());

    // The socket surface works end to end at the fd level
    let fd = zl::socket(zl::AF_INET6, zl::SOCK_STREAM, 0);
    assert!(fd >= 0);
    let fd2 = zl::socket(zl::AF_INET, zl::SOCK_DGRAM, 0);
    assert!(fd2 >= 0 && fd2 != fd);
    assert_eq!(zl::close(fd), 0);
    assert_eq!(zl::close(fd2), 0);

    // Join an ad-hoc network and observe its assignment
    let nwid = zl::adhoc_network_id(9500, 9600);
    assert_eq!(zl::join(nwid), 0);
    assert!(
        wait_for(10, || zl::network_info(nwid)
            .map(|i| i.has_ipv6())
            .unwrap_or(false)),
        "no ipv6 assignment"
    );
    let expected = std::net::IpAddr::V6(zl::rfc4193_address(nwid).expect("rfc4193"));
    let info = zl::network_info(nwid).expect("info");
    assert!(info.assigned_addrs.iter().any(|(a, _)| *a == expected));
    assert!(
        wait_for(10, || log.contains(Event::NetworkOk)),
        "network ok event never delivered"
    );
    assert_eq!(zl::leave(nwid), 0);

    // Stop, then terminal free
    assert_eq!(zl::stop(), 0);
    assert_eq!(zl::socket(zl::AF_INET, zl::SOCK_STREAM, 0), ReturnCode::Service as i32);
    assert_eq!(zl::free(), 0);

    // A restart in the same process is refused: the stack is one-shot
    assert_eq!(zl::start(config, None), ReturnCode::Service as i32);

    assert!(wait_for(5, || log.contains(Event::NodeDown)));
    assert!(log.contains(Event::NodeUp));
    assert!(log.contains(Event::StackUp));
    assert!(log.contains(Event::NodeOnline));
}
