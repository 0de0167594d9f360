//! The service orchestrator.
//!
//! Owns every long-lived component and the maintenance loop. The loop is
//! paced by the node's background-task deadline, clamped between 1 ms
//! and 100 ms so the service stays responsive to packets while never
//! spinning.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

use zerolink_core::config::{
    LOCAL_IFACE_CHECK_INTERVAL_MS, MULTICAST_CHECK_INTERVAL_MS, PEER_CACHE_EXPIRY_MS,
};
use zerolink_core::events::{AddrDetails, NodeDetails};
use zerolink_core::{
    Error, Event, EventMessage, Mac, MulticastGroup, NetworkId, NetworkInfo, NetworkStatus,
    NodeId, PeerInfo, Result, ServiceConfig, VirtRoute,
};
use zerolink_node::{ConfigOp, LocalSocket, Node, NodeHost, StateObject};
use zerolink_stack::driver::StackNotify;
use zerolink_stack::{SocketLayer, StackDriver};

use crate::binder::{
    find_usable_port, random_dynamic_port, secondary_port_for, Binder, WirePacketHandler,
};
use crate::events::{EventBus, EventHandler};
use crate::portmap::PortMapper;
use crate::storage::{FileStorage, MemStorage, Storage};
use crate::tap::{now_ms, VirtualTap};

/// Maintenance loop pacing bounds (milliseconds).
const LOOP_DELAY_MIN_MS: i64 = 1;
const LOOP_DELAY_MAX_MS: i64 = 100;
/// A delay overrun beyond this means the host slept; timers recalibrate.
const SLEEP_DETECT_MS: i64 = 10_000;
/// Peer cache cleanup cadence.
const PEERS_CLEANUP_INTERVAL_MS: i64 = 3_600_000;
/// The first local-interface publish is delayed so the port mapper has
/// time to obtain a mapping.
const FIRST_IFACE_CHECK_DELAY_MS: i64 = 15_000;

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Off,
    Starting,
    Online,
    Offline,
    Stopping,
    Stopped,
}

/// Node-facing host: routes the node's callbacks to the binder, taps,
/// storage and event bus. Late-bound references break the construction
/// cycle (the node needs its host before the binder and driver exist).
struct ServiceHost {
    bus: Arc<EventBus>,
    storage: Arc<dyn Storage>,
    binder: OnceCell<Arc<Binder>>,
    driver: OnceCell<Arc<StackDriver>>,
    node: OnceCell<Arc<Node>>,
    taps: Mutex<HashMap<NetworkId, Arc<VirtualTap>>>,
    tap_routes: Mutex<HashMap<NetworkId, Vec<VirtRoute>>>,
    hints: Mutex<HashMap<NodeId, SocketAddr>>,
    cidr_blacklist: Vec<(IpAddr, u8)>,
    fatal: AtomicBool,
}

impl ServiceHost {
    /// Every address currently assigned to one of our taps.
    fn tap_addresses(&self) -> HashSet<IpAddr> {
        let taps = self.taps.lock();
        taps.values()
            .flat_map(|t| t.ips().into_iter().map(|(ip, _)| ip))
            .collect()
    }

    fn addr_event(&self, added: bool, ip: IpAddr, nwid: NetworkId) {
        let event = match (added, ip.is_ipv4()) {
            (true, true) => Event::AddrAddedIp4,
            (false, true) => Event::AddrRemovedIp4,
            (true, false) => Event::AddrAddedIp6,
            (false, false) => Event::AddrRemovedIp6,
        };
        self.bus.post(EventMessage::with_addr(
            event,
            AddrDetails { nwid, addr: SocketAddr::new(ip, 0) },
        ));
    }

    /// Reconcile a tap's addresses and routes against a fresh config.
    fn sync_assignments(&self, tap: &Arc<VirtualTap>, info: &NetworkInfo) {
        let current: Vec<(IpAddr, u8)> = tap.ips();
        for (ip, _) in &current {
            if !info.assigned_addrs.iter().any(|(a, _)| a == ip) {
                tap.remove_ip(*ip);
                self.addr_event(false, *ip, info.nwid);
            }
        }
        for (ip, prefix) in &info.assigned_addrs {
            if tap.add_ip(*ip, *prefix) {
                self.addr_event(true, *ip, info.nwid);
            }
        }

        let mut all_routes = self.tap_routes.lock();
        let previous = all_routes.entry(info.nwid).or_default();
        for route in previous.iter() {
            if !info.routes.contains(route) {
                self.bus.post(EventMessage::with_route(Event::RouteRemoved, *route));
            }
        }
        for route in &info.routes {
            if !previous.contains(route) {
                if let Some(via) = route.via {
                    tap.add_route(via);
                }
                self.bus.post(EventMessage::with_route(Event::RouteAdded, *route));
            }
        }
        *previous = info.routes.clone();
    }
}

impl NodeHost for ServiceHost {
    fn virtual_network_config(&self, nwid: NetworkId, op: ConfigOp, info: Option<&NetworkInfo>) {
        match op {
            ConfigOp::Up | ConfigOp::Update => {
                let Some(info) = info else { return };
                let tap = {
                    let taps = self.taps.lock();
                    taps.get(&nwid).cloned()
                };
                let tap = match tap {
                    Some(t) => t,
                    None => {
                        let (Some(driver), Some(node)) = (self.driver.get(), self.node.get())
                        else {
                            return;
                        };
                        match VirtualTap::new(
                            driver.clone(),
                            node.clone(),
                            nwid,
                            info.mac,
                            info.mtu,
                        ) {
                            Ok(t) => {
                                self.taps.lock().insert(nwid, t.clone());
                                t
                            }
                            Err(e) => {
                                error!(%nwid, error = %e, "tap creation failed");
                                return;
                            }
                        }
                    }
                };
                tap.set_mtu(info.mtu);
                self.sync_assignments(&tap, info);
                if op == ConfigOp::Update {
                    self.bus.post(EventMessage::with_network(Event::NetworkUpdate, info.clone()));
                }
            }
            ConfigOp::Down | ConfigOp::Destroy => {
                if let Some(tap) = self.taps.lock().remove(&nwid) {
                    tap.shutdown();
                }
                self.tap_routes.lock().remove(&nwid);
                self.bus.post_code(Event::NetworkDown);
            }
        }
    }

    fn virtual_network_frame(
        &self,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        _vlan: u16,
        data: &[u8],
    ) {
        let tap = {
            let taps = self.taps.lock();
            taps.get(&nwid).cloned()
        };
        if let Some(tap) = tap {
            tap.put(src_mac, dst_mac, ethertype, data);
        }
    }

    fn wire_packet_send(
        &self,
        socket: Option<LocalSocket>,
        dest: SocketAddr,
        data: &[u8],
        ttl: u8,
    ) -> bool {
        let Some(binder) = self.binder.get() else { return false };
        match socket {
            Some(handle) => {
                binder.send_on(handle, dest, data, ttl) || binder.send_all(dest, data, ttl)
            }
            None => binder.send_all(dest, data, ttl),
        }
    }

    fn path_check(&self, _peer: NodeId, _socket: LocalSocket, addr: SocketAddr) -> bool {
        // Refuse paths that would carry the overlay over itself, and any
        // destination the embedder blacklisted
        let ip = addr.ip();
        if self.tap_addresses().contains(&ip) {
            return false;
        }
        !self
            .cidr_blacklist
            .iter()
            .any(|c| zerolink_core::cidr_contains(*c, &ip))
    }

    fn path_lookup(&self, peer: NodeId, want_v6: bool) -> Option<SocketAddr> {
        let hints = self.hints.lock();
        hints
            .get(&peer)
            .copied()
            .filter(|a| a.is_ipv6() == want_v6 || !want_v6)
    }

    fn state_put(&self, object: StateObject, data: &[u8]) {
        self.storage.put(object, data);
    }

    fn state_get(&self, object: StateObject) -> Option<Vec<u8>> {
        self.storage.get(object)
    }

    fn event(&self, event: Event, msg: Option<&EventMessage>) {
        if event == Event::NodeFatalError {
            self.fatal.store(true, Ordering::Release);
            self.storage.retire_identity();
        }
        match msg {
            Some(m) => self.bus.post(m.clone()),
            None => self.bus.post_code(event),
        }
    }
}

/// Receive side of the binder: wire packets go straight into the node.
struct WireRx {
    node: Arc<Node>,
    deadline: Arc<AtomicI64>,
}

impl WirePacketHandler for WireRx {
    fn on_wire_packet(&self, socket: LocalSocket, from: SocketAddr, data: &[u8]) {
        let deadline = self.node.process_wire_packet(now_ms(), socket, from, data);
        self.deadline.store(deadline, Ordering::Relaxed);
    }
}

/// The assembled service.
pub struct Service {
    config: ServiceConfig,
    state: Mutex<ServiceState>,
    runtime: Mutex<Option<Runtime>>,
    node: Arc<Node>,
    driver: Arc<StackDriver>,
    sockets: Arc<SocketLayer>,
    binder: Arc<Binder>,
    bus: Arc<EventBus>,
    storage: Arc<dyn Storage>,
    host: Arc<ServiceHost>,
    portmap: Mutex<Option<PortMapper>>,
    running: Arc<AtomicBool>,
    node_deadline: Arc<AtomicI64>,
    wire_rx: Arc<dyn WirePacketHandler>,
    ports: [u16; 3],
    peer_path_counts: Mutex<HashMap<NodeId, usize>>,
    tap_status_seen: Mutex<HashMap<NetworkId, NetworkStatus>>,
    fatal_reason: Mutex<Option<String>>,
}

impl Service {
    /// Start the process-wide service. Fails with `InvalidOp` once a
    /// stack has ever run in this process.
    pub fn start(
        config: ServiceConfig,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Result<Arc<Self>> {
        Self::start_inner(config, handler, true)
    }

    /// Start a service without the process-wide stack latch.
    ///
    /// Exists so tests can run several nodes in one process; production
    /// embeddings use [`Self::start`].
    #[doc(hidden)]
    pub fn start_unmanaged(
        config: ServiceConfig,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Result<Arc<Self>> {
        Self::start_inner(config, handler, false)
    }

    fn start_inner(
        config: ServiceConfig,
        handler: Option<Arc<dyn EventHandler>>,
        managed: bool,
    ) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("zerolink-io")
            .enable_all()
            .build()?;

        let bus = EventBus::start(config.event_queue_capacity, handler);
        match Self::build(config, managed, runtime, bus.clone()) {
            Ok(service) => Ok(service),
            Err(e) => {
                // Nothing else owns the drain thread yet; stop it so a
                // failed start leaves no thread behind
                bus.stop();
                Err(e)
            }
        }
    }

    fn build(
        config: ServiceConfig,
        managed: bool,
        runtime: Runtime,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        let storage: Arc<dyn Storage> = match &config.home {
            Some(home) => {
                let store_bus = bus.clone();
                Arc::new(FileStorage::open(
                    home,
                    Some(Arc::new(move |e| store_bus.post_code(e))),
                )?)
            }
            None => Arc::new(MemStorage::new()),
        };
        // Created eagerly so the file exists before anything can want it
        let _ = storage.auth_token();

        let host = Arc::new(ServiceHost {
            bus: bus.clone(),
            storage: storage.clone(),
            binder: OnceCell::new(),
            driver: OnceCell::new(),
            node: OnceCell::new(),
            taps: Mutex::new(HashMap::new()),
            tap_routes: Mutex::new(HashMap::new()),
            hints: Mutex::new(HashMap::new()),
            cidr_blacklist: config.cidr_blacklist.clone(),
            fatal: AtomicBool::new(false),
        });

        let node = Arc::new(Node::new(host.clone() as Arc<dyn NodeHost>)?);
        let _ = host.node.set(node.clone());

        let stack_bus = bus.clone();
        let notify = Arc::new(move |n: StackNotify| match n {
            StackNotify::Up => stack_bus.post_code(Event::StackUp),
            StackNotify::Down => stack_bus.post_code(Event::StackDown),
            StackNotify::NetifUp(d) => {
                stack_bus.post(EventMessage::with_netif(Event::NetifUp, d))
            }
            StackNotify::NetifRemoved(d) => {
                stack_bus.post(EventMessage::with_netif(Event::NetifRemoved, d))
            }
        });
        let driver = if managed {
            StackDriver::start(notify)?
        } else {
            StackDriver::start_unmanaged(notify)
        };
        let _ = host.driver.set(driver.clone());
        if !driver.wait_running(std::time::Duration::from_secs(10)) {
            driver.shutdown();
            return Err(Error::fatal("stack failed to come up"));
        }

        let sockets = Arc::new(SocketLayer::new(driver.clone()));
        let binder = Arc::new(Binder::new(runtime.handle().clone()));
        let _ = host.binder.set(binder.clone());

        // Port policy: caller-chosen or random primary, an address-derived
        // secondary to dodge NAT collisions between colocated nodes, and
        // an auxiliary port for the mapper
        let primary_start = if config.primary_port == 0 {
            random_dynamic_port()
        } else {
            config.primary_port
        };
        let primary =
            find_usable_port(primary_start).ok_or(Error::Config("no bindable primary port".into()))?;
        let secondary = if config.allow_secondary_port {
            find_usable_port(secondary_port_for(node.address())).unwrap_or(0)
        } else {
            0
        };
        let aux = if config.allow_port_mapping {
            find_usable_port(primary.wrapping_add(1).max(20000)).unwrap_or(0)
        } else {
            0
        };
        let ports = [primary, secondary, aux];
        info!(primary, secondary, aux, "service ports selected");

        let node_deadline = Arc::new(AtomicI64::new(0));
        let wire_rx: Arc<dyn WirePacketHandler> = Arc::new(WireRx {
            node: node.clone(),
            deadline: node_deadline.clone(),
        });
        binder.refresh(&ports, &config, &host.tap_addresses(), &wire_rx);

        let portmap = if aux != 0 {
            Some(PortMapper::start(runtime.handle(), aux))
        } else {
            None
        };

        let service = Arc::new(Self {
            config,
            state: Mutex::new(ServiceState::Starting),
            runtime: Mutex::new(Some(runtime)),
            node: node.clone(),
            driver,
            sockets,
            binder,
            bus: bus.clone(),
            storage: storage.clone(),
            host,
            portmap: Mutex::new(portmap),
            running: Arc::new(AtomicBool::new(true)),
            node_deadline,
            wire_rx,
            ports,
            peer_path_counts: Mutex::new(HashMap::new()),
            tap_status_seen: Mutex::new(HashMap::new()),
            fatal_reason: Mutex::new(None),
        });

        // First local-address publish happens immediately so the node can
        // come online; later passes follow the slower cadence that gives
        // the port mapper time to settle
        service.publish_local_addresses();

        // Re-join cached networks before the first maintenance pass
        if service.config.network_caching {
            for nwid in storage.cached_networks() {
                debug!(%nwid, "re-joining cached network");
                node.join(nwid, now_ms());
            }
        }

        bus.post(EventMessage::with_node(
            Event::NodeUp,
            NodeDetails {
                address: node.address(),
                primary_port: primary,
                version: zerolink_node::VERSION,
            },
        ));

        let loop_service = service.clone();
        let handle = {
            let guard = service.runtime.lock();
            let rt = guard.as_ref().ok_or(Error::InvalidOp)?;
            rt.spawn(async move { loop_service.maintenance_loop().await })
        };
        drop(handle);

        Ok(service)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    async fn maintenance_loop(self: Arc<Self>) {
        let started = now_ms();
        let mut clock_should_be = started;
        let mut last_bind_refresh = started;
        let mut last_multicast_check = started;
        let mut last_iface_check =
            started - LOCAL_IFACE_CHECK_INTERVAL_MS + FIRST_IFACE_CHECK_DELAY_MS;
        let mut last_peers_cleanup = started;

        while self.running.load(Ordering::Acquire) {
            let now = now_ms();

            // Sleep/wake detection: a large delay overrun means the host
            // clock jumped and every timer needs recalibrating
            let restarted = now > clock_should_be + SLEEP_DETECT_MS;
            if restarted {
                info!("clock jump detected, recalibrating");
            }

            if restarted || now - last_bind_refresh >= self.config.bind_refresh_interval_ms() {
                last_bind_refresh = now;
                self.binder.refresh(
                    &self.ports,
                    &self.config,
                    &self.host.tap_addresses(),
                    &self.wire_rx,
                );
            }

            self.generate_event_messages();

            if self.node_deadline.load(Ordering::Relaxed) <= now {
                match self.node.process_background_tasks(now) {
                    Ok(deadline) => {
                        self.node_deadline.store(deadline, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.handle_fatal(e.to_string());
                        break;
                    }
                }
            }
            if self.host.fatal.load(Ordering::Acquire) {
                self.handle_fatal("node reported a fatal error".into());
                break;
            }

            if now - last_multicast_check >= MULTICAST_CHECK_INTERVAL_MS {
                last_multicast_check = now;
                self.sync_multicast_groups(now);
            }

            if now - last_iface_check >= LOCAL_IFACE_CHECK_INTERVAL_MS {
                last_iface_check = now;
                self.publish_local_addresses();
            }

            if now - last_peers_cleanup >= PEERS_CLEANUP_INTERVAL_MS {
                last_peers_cleanup = now;
                self.storage.cleanup_peers(PEER_CACHE_EXPIRY_MS);
            }

            // Track online/offline transitions
            {
                let mut state = self.state.lock();
                let next = if self.node.online() {
                    ServiceState::Online
                } else {
                    ServiceState::Offline
                };
                if matches!(*state, ServiceState::Starting | ServiceState::Online | ServiceState::Offline)
                    && *state != next
                {
                    *state = next;
                }
            }

            let deadline = self.node_deadline.load(Ordering::Relaxed);
            let delay = (deadline - now).clamp(LOOP_DELAY_MIN_MS, LOOP_DELAY_MAX_MS);
            clock_should_be = now + delay;
            tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
        }
    }

    /// Publish network and peer status changes since the previous pass.
    /// Held back until both the node and the stack are up, so embedders
    /// see a coherent startup sequence.
    fn generate_event_messages(&self) {
        if !self.node.online() || !self.driver.running() {
            return;
        }

        let taps: Vec<(NetworkId, Arc<VirtualTap>)> = {
            let taps = self.host.taps.lock();
            taps.iter().map(|(n, t)| (*n, t.clone())).collect()
        };
        for (nwid, tap) in taps {
            let Some(info) = self.node.network(nwid) else { continue };
            let status = info.status;
            let mut seen = self.tap_status_seen.lock();
            if seen.get(&nwid) == Some(&status) {
                continue;
            }
            seen.insert(nwid, status);
            drop(seen);

            let event = match status {
                NetworkStatus::NotFound => Some(Event::NetworkNotFound),
                NetworkStatus::ClientTooOld => Some(Event::NetworkClientTooOld),
                NetworkStatus::RequestingConfig => Some(Event::NetworkRequestingConfig),
                NetworkStatus::AccessDenied => Some(Event::NetworkAccessDenied),
                NetworkStatus::Ok => Some(Event::NetworkOk),
                NetworkStatus::PortError => None,
            };
            if let Some(event) = event {
                self.bus.post(EventMessage::with_network(event, info.clone()));
            }
            if status == NetworkStatus::Ok && tap.is_up() {
                if tap.has_ipv4() {
                    self.bus
                        .post(EventMessage::with_network(Event::NetworkReadyIp4, info.clone()));
                }
                if tap.has_ipv6() {
                    self.bus
                        .post(EventMessage::with_network(Event::NetworkReadyIp6, info.clone()));
                }
            }
        }

        let now = now_ms();
        let peers = self.node.peers(now);
        let mut counts = self.peer_path_counts.lock();
        for peer in peers {
            let alive = peer.paths.iter().filter(|p| !p.expired).count();
            let previous = counts.insert(peer.address, alive);
            let event = match (previous, alive) {
                (None, n) if n > 0 => Some(Event::PeerDirect),
                (None, _) => Some(Event::PeerRelay),
                (Some(0), n) if n > 0 => Some(Event::PeerDirect),
                (Some(p), 0) if p > 0 => Some(Event::PeerRelay),
                _ => None,
            };
            if let Some(event) = event {
                self.bus.post(EventMessage::with_peer(event, peer));
            }
        }
    }

    fn sync_multicast_groups(&self, now: i64) {
        let taps: Vec<(NetworkId, Arc<VirtualTap>)> = {
            let taps = self.host.taps.lock();
            taps.iter().map(|(n, t)| (*n, t.clone())).collect()
        };
        for (nwid, tap) in taps {
            let (added, removed) = tap.scan_multicast_groups();
            for group in added {
                self.node.multicast_subscribe(nwid, group, now);
            }
            for group in removed {
                self.node.multicast_unsubscribe(nwid, group, now);
            }
        }
    }

    fn publish_local_addresses(&self) {
        self.node.clear_local_interface_addresses();
        for addr in self.binder.bound_addresses() {
            self.node.add_local_interface_address(addr);
        }
        if let Some(pm) = self.portmap.lock().as_ref() {
            for addr in pm.external_addresses() {
                self.node.add_local_interface_address(addr);
            }
        }
    }

    fn handle_fatal(&self, reason: String) {
        error!(reason = %reason, "fatal service error");
        *self.fatal_reason.lock() = Some(reason);
        self.bus.post_code(Event::NodeFatalError);
        self.teardown();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn teardown(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ServiceState::Stopping | ServiceState::Stopped) {
                return;
            }
            *state = ServiceState::Stopping;
        }
        self.running.store(false, Ordering::Release);
        if let Some(pm) = self.portmap.lock().take() {
            pm.stop();
        }
        let taps: Vec<Arc<VirtualTap>> = {
            let mut taps = self.host.taps.lock();
            taps.drain().map(|(_, t)| t).collect()
        };
        for tap in taps {
            tap.shutdown();
            self.bus.post_code(Event::NetworkDown);
        }
        self.binder.close_all();
        self.bus.post_code(Event::NodeDown);
        *self.state.lock() = ServiceState::Stopped;
    }

    /// Stop the service: taps first, then the node. The stack keeps
    /// running until [`Self::free`].
    pub fn stop(&self) {
        info!("service stopping");
        self.teardown();
    }

    /// Terminal teardown: also stops the stack driver and the event bus.
    /// No service can start again in this process afterwards.
    pub fn free(&self) {
        self.stop();
        self.driver.shutdown();
        self.bus.stop();
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
        }
    }

    // ------------------------------------------------------------------
    // Queries and operations
    // ------------------------------------------------------------------

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// True once socket calls may proceed: the node is online and the
    /// stack is running.
    pub fn is_ready(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.node.online() && self.driver.running()
    }

    /// True while the service accepts operations at all.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn node_id(&self) -> NodeId {
        self.node.address()
    }

    pub fn node_online(&self) -> bool {
        self.node.online()
    }

    pub fn primary_port(&self) -> u16 {
        self.ports[0]
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason.lock().clone()
    }

    /// The socket layer, for the SDK surface.
    pub fn sockets(&self) -> &Arc<SocketLayer> {
        &self.sockets
    }

    /// Stack traffic counters.
    pub fn stack_stats(&self) -> &zerolink_stack::StackStats {
        self.driver.stats()
    }

    pub fn join(&self, nwid: NetworkId) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ServiceNotRunning);
        }
        self.node.join(nwid, now_ms());
        Ok(())
    }

    pub fn leave(&self, nwid: NetworkId) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ServiceNotRunning);
        }
        self.node.leave(nwid);
        self.tap_status_seen.lock().remove(&nwid);
        Ok(())
    }

    pub fn leave_all(&self) -> Result<()> {
        for nwid in self.node.networks() {
            self.leave(nwid)?;
        }
        Ok(())
    }

    pub fn orbit(&self, moon_id: u64, moon_seed: u64) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ServiceNotRunning);
        }
        self.node.orbit(moon_id, moon_seed);
        Ok(())
    }

    pub fn deorbit(&self, moon_id: u64) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ServiceNotRunning);
        }
        self.node.deorbit(moon_id);
        Ok(())
    }

    /// Subscribe this node's virtual interface to a multicast group on a
    /// joined network. The orchestrator keeps address-derived groups in
    /// sync automatically; this is for application-chosen groups.
    pub fn multicast_subscribe(&self, nwid: NetworkId, group: MulticastGroup) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ServiceNotRunning);
        }
        self.node.multicast_subscribe(nwid, group, now_ms());
        Ok(())
    }

    /// Drop a multicast subscription.
    pub fn multicast_unsubscribe(&self, nwid: NetworkId, group: MulticastGroup) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ServiceNotRunning);
        }
        self.node.multicast_unsubscribe(nwid, group, now_ms());
        Ok(())
    }

    pub fn network_info(&self, nwid: NetworkId) -> Option<NetworkInfo> {
        self.node.network(nwid)
    }

    pub fn networks(&self) -> Vec<NetworkId> {
        self.node.networks()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.node.peers(now_ms())
    }

    /// Direct / relay / unreachable classification for one peer.
    pub fn peer_status(&self, peer: NodeId) -> Event {
        let peers = self.node.peers(now_ms());
        match peers.iter().find(|p| p.address == peer) {
            Some(p) if p.paths.iter().any(|path| !path.expired) => Event::PeerDirect,
            Some(_) => Event::PeerRelay,
            None => Event::PeerUnreachable,
        }
    }

    /// Static address hint for reaching a peer (first-contact bootstrap).
    pub fn add_peer_hint(&self, peer: NodeId, addr: SocketAddr) {
        self.host.hints.lock().insert(peer, addr);
    }

    /// Swap the event handler.
    pub fn set_event_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        self.bus.set_handler(handler);
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
