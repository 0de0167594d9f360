//! Stack driver: owns every virtual interface and the poll thread.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use parking_lot::{Condvar, Mutex};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};
use tracing::{debug, info, warn};

use zerolink_core::events::NetifDetails;
use zerolink_core::{Error, Mac, NetworkId, Result};

use crate::device::{FrameSink, TapDevice};
use crate::stats::{Dir, StackStats};

/// Handle to one virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetifId(pub u64);

/// Driver lifecycle. `Stopped` is terminal for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPhase {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Lifecycle notifications surfaced to the embedder (mapped to events by
/// the service layer).
#[derive(Debug, Clone)]
pub enum StackNotify {
    Up,
    Down,
    NetifUp(NetifDetails),
    NetifRemoved(NetifDetails),
}

/// Once any driver in this process has stopped, no driver may start again:
/// the cooperative core's pools are treated as non-recreatable.
static STACK_STARTED: AtomicBool = AtomicBool::new(false);
static STACK_STOPPED: AtomicBool = AtomicBool::new(false);

/// Idle poll cadence when no timer is pending.
const IDLE_POLL_MS: u64 = 50;
/// How long a closed socket may linger in the set while its FIN drains.
pub(crate) const GRAVEYARD_LINGER_MS: i64 = 2_000;

pub(crate) struct Netif {
    pub nwid: NetworkId,
    pub mac: Mac,
    pub up: bool,
    pub iface: Interface,
    pub device: TapDevice,
}

pub(crate) struct CoreState {
    pub phase: StackPhase,
    pub netifs: BTreeMap<NetifId, Netif>,
    pub sockets: SocketSet<'static>,
    /// TCP sockets closed by the application, awaiting FIN completion.
    pub graveyard: Vec<(SocketHandle, i64)>,
    next_netif: u64,
    next_ephemeral: u16,
}

impl CoreState {
    /// Allocate an ephemeral local port.
    pub fn ephemeral_port(&mut self) -> u16 {
        let p = self.next_ephemeral;
        self.next_ephemeral = if p >= 65500 { 49152 } else { p + 1 };
        p
    }
}

/// Shared heart of the driver. The mutex is the core lock; every entry
/// into protocol state from outside the poll thread goes through it.
pub(crate) struct Core {
    pub state: Mutex<CoreState>,
    /// Signaled whenever a poll makes progress; blocked socket calls wait
    /// here.
    pub wake: Condvar,
    /// Signaled to cut the poll thread's sleep short.
    pub poll_wake: Condvar,
    /// Inbound frames staged outside the core lock, drained by the poll
    /// thread. This keeps `inject_frame` callable from poll callbacks.
    pub pending_rx: Mutex<Vec<(NetifId, Vec<u8>)>>,
    pub stats: Arc<StackStats>,
}

impl Core {
    /// Run `f` under the core lock and nudge the poll thread afterwards.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut CoreState) -> R) -> R {
        let mut st = self.state.lock();
        let r = f(&mut st);
        drop(st);
        self.poll_wake.notify_all();
        r
    }
}

struct StatsSink {
    stats: Arc<StackStats>,
    inner: Arc<dyn FrameSink>,
}

impl FrameSink for StatsSink {
    fn transmit(&self, frame: &[u8]) {
        self.stats.account(Dir::Tx, frame);
        self.inner.transmit(frame);
    }
}

/// The stack driver. One per process; see [`StackDriver::start`].
pub struct StackDriver {
    core: Arc<Core>,
    notify: Arc<dyn Fn(StackNotify) + Send + Sync>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StackDriver {
    /// Start the process-wide stack. Fails with `InvalidOp` if a stack was
    /// ever started (or stopped) before in this process.
    pub fn start(notify: Arc<dyn Fn(StackNotify) + Send + Sync>) -> Result<Arc<Self>> {
        if STACK_STOPPED.load(Ordering::Acquire) || STACK_STARTED.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidOp);
        }
        Ok(Self::spawn(notify))
    }

    /// Start a driver without engaging the process-wide lifecycle latch.
    ///
    /// Intended for embedding tests that need several stack instances in
    /// one process; production code goes through [`Self::start`].
    #[doc(hidden)]
    pub fn start_unmanaged(notify: Arc<dyn Fn(StackNotify) + Send + Sync>) -> Arc<Self> {
        Self::spawn(notify)
    }

    fn spawn(notify: Arc<dyn Fn(StackNotify) + Send + Sync>) -> Arc<Self> {
        let core = Arc::new(Core {
            state: Mutex::new(CoreState {
                phase: StackPhase::Initializing,
                netifs: BTreeMap::new(),
                sockets: SocketSet::new(Vec::new()),
                graveyard: Vec::new(),
                next_netif: 1,
                next_ephemeral: 49152,
            }),
            wake: Condvar::new(),
            poll_wake: Condvar::new(),
            pending_rx: Mutex::new(Vec::new()),
            stats: Arc::new(StackStats::default()),
        });
        let driver = Arc::new(Self {
            core: core.clone(),
            notify: notify.clone(),
            thread: Mutex::new(None),
        });
        let handle = std::thread::Builder::new()
            .name("zerolink-tcpip".into())
            .spawn(move || poll_loop(core, notify))
            .ok();
        *driver.thread.lock() = handle;
        driver
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn phase(&self) -> StackPhase {
        self.core.state.lock().phase
    }

    /// True while socket calls are allowed.
    pub fn running(&self) -> bool {
        self.phase() == StackPhase::Running
    }

    /// Block until the poll thread reports `Running` (or the timeout
    /// expires). Used during service start.
    pub fn wait_running(&self, timeout: StdDuration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut st = self.core.state.lock();
        loop {
            if st.phase == StackPhase::Running {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            self.core.wake.wait_for(&mut st, deadline - now);
        }
    }

    pub fn stats(&self) -> &StackStats {
        &self.core.stats
    }

    /// Create a netif for a network. The interface comes up immediately
    /// with an EUI-64 link-local address; routable addresses arrive later
    /// through [`Self::add_ip`].
    pub fn add_netif(
        &self,
        nwid: NetworkId,
        mac: Mac,
        mtu: usize,
        sink: Arc<dyn FrameSink>,
    ) -> Result<NetifId> {
        let sink = Arc::new(StatsSink { stats: self.core.stats.clone(), inner: sink });
        let mut st = self.core.state.lock();
        if st.phase == StackPhase::Stopping || st.phase == StackPhase::Stopped {
            return Err(Error::ServiceNotRunning);
        }
        let mut device = TapDevice::new(mtu, sink);
        let mut config = Config::new(HardwareAddress::Ethernet(EthernetAddress(mac.0)));
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, Instant::now());
        let ll = link_local_for(mac);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(ll), 64));
        });
        let id = NetifId(st.next_netif);
        st.next_netif += 1;
        st.netifs.insert(id, Netif { nwid, mac, up: true, iface, device });
        drop(st);
        self.core.poll_wake.notify_all();
        info!(%nwid, %mac, mtu, "netif up");
        (self.notify)(StackNotify::NetifUp(NetifDetails { nwid, mac, mtu }));
        Ok(id)
    }

    /// Detach and free a netif.
    pub fn remove_netif(&self, id: NetifId) {
        let removed = {
            let mut st = self.core.state.lock();
            st.netifs.remove(&id)
        };
        if let Some(n) = removed {
            self.core.poll_wake.notify_all();
            info!(nwid = %n.nwid, "netif removed");
            (self.notify)(StackNotify::NetifRemoved(NetifDetails {
                nwid: n.nwid,
                mac: n.mac,
                mtu: n.device.mtu(),
            }));
        }
    }

    /// Add an address to a netif.
    pub fn add_ip(&self, id: NetifId, ip: IpAddr, prefix: u8) -> Result<()> {
        self.core.with_state(|st| {
            let netif = st.netifs.get_mut(&id).ok_or(Error::Arg("no such netif"))?;
            let cidr = IpCidr::new(to_smol_ip(ip), prefix);
            let mut ok = true;
            netif.iface.update_ip_addrs(|addrs| {
                if addrs.iter().any(|a| *a == cidr) {
                    return;
                }
                ok = addrs.push(cidr).is_ok();
            });
            if ok {
                debug!(%ip, prefix, "address added to netif");
                Ok(())
            } else {
                warn!(%ip, "netif address table full");
                Err(Error::Arg("netif address table full"))
            }
        })
    }

    /// Remove an address from a netif.
    pub fn remove_ip(&self, id: NetifId, ip: IpAddr) -> Result<()> {
        self.core.with_state(|st| {
            let netif = st.netifs.get_mut(&id).ok_or(Error::Arg("no such netif"))?;
            netif.iface.update_ip_addrs(|addrs| {
                addrs.retain(|a| a.address() != to_smol_ip(ip));
            });
            Ok(())
        })
    }

    /// Install a default route through `via`.
    pub fn add_default_route(&self, id: NetifId, via: IpAddr) -> Result<()> {
        self.core.with_state(|st| {
            let netif = st.netifs.get_mut(&id).ok_or(Error::Arg("no such netif"))?;
            let res = match via {
                IpAddr::V4(gw) => netif
                    .iface
                    .routes_mut()
                    .add_default_ipv4_route(Ipv4Address(gw.octets()))
                    .map(|_| ()),
                IpAddr::V6(gw) => netif
                    .iface
                    .routes_mut()
                    .add_default_ipv6_route(Ipv6Address(gw.octets()))
                    .map(|_| ()),
            };
            res.map_err(|_| Error::Arg("route table full"))
        })
    }

    /// Change a netif's MTU (affects frames from the next poll on).
    pub fn set_mtu(&self, id: NetifId, mtu: usize) {
        self.core.with_state(|st| {
            if let Some(n) = st.netifs.get_mut(&id) {
                n.device.set_mtu(mtu);
            }
        });
    }

    /// Link state control.
    pub fn set_link(&self, id: NetifId, up: bool) {
        self.core.with_state(|st| {
            if let Some(n) = st.netifs.get_mut(&id) {
                n.up = up;
            }
        });
    }

    /// True when the netif exists and its link is up.
    pub fn netif_is_up(&self, id: NetifId) -> bool {
        self.core
            .state
            .lock()
            .netifs
            .get(&id)
            .map(|n| n.up)
            .unwrap_or(false)
    }

    /// The addresses currently on a netif.
    pub fn netif_addrs(&self, id: NetifId) -> Vec<(IpAddr, u8)> {
        let st = self.core.state.lock();
        st.netifs
            .get(&id)
            .map(|n| {
                n.iface
                    .ip_addrs()
                    .iter()
                    .map(|c| (from_smol_ip(c.address()), c.prefix_len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Submit one decrypted inbound Ethernet frame to a netif. Never
    /// takes the core lock, so it is safe from any context, including
    /// transmit hooks running inside the poll itself.
    pub fn inject_frame(&self, id: NetifId, frame: Vec<u8>) {
        self.core.stats.account(Dir::Rx, &frame);
        self.core.pending_rx.lock().push((id, frame));
        self.core.poll_wake.notify_all();
    }

    /// Wake the poll thread early.
    pub fn kick(&self) {
        self.core.poll_wake.notify_all();
    }

    /// Terminal shutdown. After this returns no stack can run again in
    /// this process.
    pub fn shutdown(&self) {
        STACK_STOPPED.store(true, Ordering::Release);
        {
            let mut st = self.core.state.lock();
            if st.phase == StackPhase::Stopped {
                return;
            }
            st.phase = StackPhase::Stopping;
        }
        self.core.poll_wake.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn poll_loop(core: Arc<Core>, notify: Arc<dyn Fn(StackNotify) + Send + Sync>) {
    {
        let mut st = core.state.lock();
        if st.phase == StackPhase::Initializing {
            st.phase = StackPhase::Running;
        }
    }
    core.wake.notify_all();
    info!("tcpip thread running");
    notify(StackNotify::Up);

    loop {
        let mut st = core.state.lock();
        if st.phase != StackPhase::Running {
            let state = &mut *st;
            for (_, netif) in std::mem::take(&mut state.netifs) {
                notify(StackNotify::NetifRemoved(NetifDetails {
                    nwid: netif.nwid,
                    mac: netif.mac,
                    mtu: netif.device.mtu(),
                }));
            }
            state.graveyard.clear();
            state.phase = StackPhase::Stopped;
            break;
        }

        let state = &mut *st;
        let now = Instant::now();

        // Stage injected frames into their device queues
        let pending = std::mem::take(&mut *core.pending_rx.lock());
        for (id, frame) in pending {
            if let Some(n) = state.netifs.get_mut(&id) {
                if n.up {
                    n.device.enqueue_rx(frame);
                }
            }
        }

        let mut progressed = false;
        for netif in state.netifs.values_mut() {
            if netif.up {
                progressed |= netif.iface.poll(now, &mut netif.device, &mut state.sockets);
            }
        }

        // Reap closed sockets whose FIN handshakes are done (or overdue)
        let now_ms = now.total_millis();
        let mut keep = Vec::with_capacity(state.graveyard.len());
        for (handle, deadline) in state.graveyard.drain(..) {
            let closed = state.sockets.get::<tcp::Socket>(handle).state() == tcp::State::Closed;
            if closed || now_ms >= deadline {
                state.sockets.remove(handle);
            } else {
                keep.push((handle, deadline));
            }
        }
        state.graveyard = keep;

        let mut delay_ms = IDLE_POLL_MS;
        for netif in state.netifs.values_mut() {
            if netif.up {
                if let Some(d) = netif.iface.poll_delay(now, &state.sockets) {
                    delay_ms = delay_ms.min((d.total_millis() as u64).max(1));
                }
            }
        }

        if progressed {
            core.wake.notify_all();
        }
        // Frames injected while we were polling must not wait out the
        // whole timer
        if core.pending_rx.lock().is_empty() {
            core.poll_wake
                .wait_for(&mut st, StdDuration::from_millis(delay_ms));
        }
    }

    core.wake.notify_all();
    info!("tcpip thread exiting");
    notify(StackNotify::Down);
}

/// Std → smoltcp address conversion (explicit so no conversion trait
/// availability is assumed).
pub(crate) fn to_smol_ip(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address(v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address(v6.octets())),
    }
}

/// smoltcp → std address conversion.
pub(crate) fn from_smol_ip(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(std::net::Ipv4Addr::from(v4.0)),
        IpAddress::Ipv6(v6) => IpAddr::V6(std::net::Ipv6Addr::from(v6.0)),
    }
}

/// EUI-64 link-local address for a MAC.
fn link_local_for(mac: Mac) -> Ipv6Address {
    let m = mac.0;
    Ipv6Address::new(
        0xfe80,
        0,
        0,
        0,
        u16::from_be_bytes([m[0] ^ 0x02, m[1]]),
        u16::from_be_bytes([m[2], 0xff]),
        u16::from_be_bytes([0xfe, m[3]]),
        u16::from_be_bytes([m[4], m[5]]),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct NullSink;
    impl FrameSink for NullSink {
        fn transmit(&self, _frame: &[u8]) {}
    }

    fn start_test_driver() -> (Arc<StackDriver>, Arc<PlMutex<Vec<StackNotify>>>) {
        let notes: Arc<PlMutex<Vec<StackNotify>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink_notes = notes.clone();
        let driver = StackDriver::start_unmanaged(Arc::new(move |n| {
            sink_notes.lock().push(n);
        }));
        assert!(driver.wait_running(StdDuration::from_secs(5)));
        (driver, notes)
    }

    #[test]
    fn netif_lifecycle() {
        let (driver, notes) = start_test_driver();
        let nwid = NetworkId(0x1122334455667788);
        let mac = Mac([0x02, 1, 2, 3, 4, 5]);
        let id = driver.add_netif(nwid, mac, 1500, Arc::new(NullSink)).unwrap();
        assert!(driver.netif_is_up(id));

        driver.add_ip(id, "10.7.0.5".parse().unwrap(), 16).unwrap();
        let addrs = driver.netif_addrs(id);
        assert!(addrs.contains(&("10.7.0.5".parse().unwrap(), 16)));
        // Link-local came up with the netif
        assert!(addrs.iter().any(|(a, _)| matches!(a, IpAddr::V6(v6) if v6.segments()[0] == 0xfe80)));

        driver.remove_ip(id, "10.7.0.5".parse().unwrap()).unwrap();
        assert!(!driver
            .netif_addrs(id)
            .contains(&("10.7.0.5".parse().unwrap(), 16)));

        driver.remove_netif(id);
        assert!(!driver.netif_is_up(id));
        let notes = notes.lock();
        assert!(matches!(notes[0], StackNotify::Up));
        assert!(notes.iter().any(|n| matches!(n, StackNotify::NetifUp(d) if d.nwid == nwid)));
        assert!(notes.iter().any(|n| matches!(n, StackNotify::NetifRemoved(_))));
    }

    #[test]
    fn shutdown_is_terminal_for_public_start() {
        let (driver, notes) = start_test_driver();
        driver.shutdown();
        assert_eq!(driver.phase(), StackPhase::Stopped);
        assert!(notes.lock().iter().any(|n| matches!(n, StackNotify::Down)));
        // The managed entry point refuses to start after any stop
        assert!(StackDriver::start(Arc::new(|_| {})).is_err());
    }

    #[test]
    fn ephemeral_ports_wrap() {
        let (driver, _) = start_test_driver();
        let mut st = driver.core().state.lock();
        st.next_ephemeral = 65500;
        assert_eq!(st.ephemeral_port(), 65500);
        assert_eq!(st.ephemeral_port(), 49152);
    }
}
