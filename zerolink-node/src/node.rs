//! The overlay node proper.
//!
//! All entry points are synchronous and thread-safe; internal state sits
//! behind one mutex, and every outward effect (wire sends, frame
//! deliveries, config callbacks, events) is collected while the lock is
//! held and dispatched after it is released, so [`NodeHost`]
//! implementations may call back into the node freely.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use zerolink_core::{
    Error, Event, EventMessage, Mac, MulticastGroup, NetworkId, NetworkInfo, NetworkStatus,
    NodeId, PeerInfo, PeerRole, Result,
};

use crate::identity::Identity;
use crate::network::{
    Membership, CONFIG_REQUEST_INTERVAL_MS, MULTICAST_ANNOUNCE_INTERVAL_MS,
};
use crate::peer::{Peer, PATH_KEEPALIVE_MS, PEER_EXPIRY_MS};
use crate::wire::{
    self, encode_clear, parse_envelope, Config, ConfigReply, ConfigRequest, FramePayload, Hello,
    MulticastLike, OkHello, SessionKey, Verb,
};
use crate::VERSION;

/// Handle to one of the binder's bound UDP sockets, opaque to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalSocket(pub u64);

/// Kinds of persistent state the node reads and writes through its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateObject {
    IdentityPublic,
    IdentitySecret,
    Planet,
    NetworkConfig(NetworkId),
    Peer(NodeId),
}

/// Virtual-network lifecycle operations reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOp {
    Up,
    Update,
    Down,
    Destroy,
}

/// Everything the node needs from its embedder. Callbacks run synchronously
/// on the thread that entered the node; implementations must not block.
pub trait NodeHost: Send + Sync {
    /// A network came up, changed, went down or was destroyed.
    fn virtual_network_config(&self, nwid: NetworkId, op: ConfigOp, info: Option<&NetworkInfo>);

    /// A decrypted inbound Ethernet frame for a joined network.
    fn virtual_network_frame(
        &self,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        vlan: u16,
        data: &[u8],
    );

    /// Send an encrypted datagram. `socket` of `None` means "every usable
    /// socket" (used before a good path is known). Returns false when
    /// nothing could be sent.
    fn wire_packet_send(
        &self,
        socket: Option<LocalSocket>,
        dest: SocketAddr,
        data: &[u8],
        ttl: u8,
    ) -> bool;

    /// Veto hook for learning a path (recursion and blacklist checks).
    fn path_check(&self, _peer: NodeId, _socket: LocalSocket, _addr: SocketAddr) -> bool {
        true
    }

    /// Static address hint for a peer from user configuration.
    fn path_lookup(&self, _peer: NodeId, _want_v6: bool) -> Option<SocketAddr> {
        None
    }

    /// Persist a state object (empty data deletes it).
    fn state_put(&self, object: StateObject, data: &[u8]);

    /// Fetch a state object.
    fn state_get(&self, object: StateObject) -> Option<Vec<u8>>;

    /// Out-of-band node events (online/offline transitions, fatal errors).
    fn event(&self, event: Event, msg: Option<&EventMessage>);
}

/// Counters for transient failures and traffic; never reset.
#[derive(Debug, Default)]
pub struct NodeStats {
    pub wire_in: AtomicU64,
    pub wire_out: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub dropped: AtomicU64,
    pub auth_failures: AtomicU64,
    pub unknown_peers: AtomicU64,
}

enum Action {
    Send {
        socket: Option<LocalSocket>,
        dest: SocketAddr,
        data: Vec<u8>,
        ttl: u8,
    },
    Deliver {
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        vlan: u16,
        data: Vec<u8>,
    },
    Config {
        nwid: NetworkId,
        op: ConfigOp,
        info: Option<NetworkInfo>,
    },
    StatePut {
        object: StateObject,
        data: Vec<u8>,
    },
    Event {
        event: Event,
        msg: Option<EventMessage>,
    },
}

struct Inner {
    peers: HashMap<NodeId, Peer>,
    networks: HashMap<NetworkId, Membership>,
    /// Networks that have had their UP reported to the host.
    configured: HashMap<NetworkId, bool>,
    moons: Vec<u64>,
    local_addrs: Vec<SocketAddr>,
    last_peer_persist: i64,
}

/// The overlay node.
pub struct Node {
    identity: Identity,
    host: Arc<dyn NodeHost>,
    inner: Mutex<Inner>,
    stats: NodeStats,
    online: AtomicBool,
    fatal: Mutex<Option<String>>,
    fatal_flag: AtomicBool,
}

impl Node {
    /// Construct a node, loading the identity through the host's state
    /// store or generating (and persisting) a fresh one.
    pub fn new(host: Arc<dyn NodeHost>) -> Result<Self> {
        let identity = match host.state_get(StateObject::IdentitySecret) {
            Some(blob) => {
                let text = String::from_utf8(blob)
                    .map_err(|_| Error::fatal("identity blob is not UTF-8"))?;
                let id: Identity = text
                    .parse()
                    .map_err(|_| Error::fatal("identity is corrupt"))?;
                if !id.has_secret() {
                    return Err(Error::fatal("stored identity has no secret"));
                }
                id
            }
            None => {
                let id = Identity::generate();
                if let Some(secret) = id.to_secret_blob() {
                    host.state_put(StateObject::IdentitySecret, secret.as_bytes());
                }
                host.state_put(StateObject::IdentityPublic, id.to_public_blob().as_bytes());
                id
            }
        };
        debug!(address = %identity.address(), "node identity ready");
        Ok(Self {
            identity,
            host,
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                networks: HashMap::new(),
                configured: HashMap::new(),
                moons: Vec::new(),
                local_addrs: Vec::new(),
                last_peer_persist: 0,
            }),
            stats: NodeStats::default(),
            online: AtomicBool::new(false),
            fatal: Mutex::new(None),
            fatal_flag: AtomicBool::new(false),
        })
    }

    /// This node's immutable overlay address.
    pub fn address(&self) -> NodeId {
        self.identity.address()
    }

    /// Our identity (public half is what peers learn from HELLOs).
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// True once the node can reach the overlay (it has at least one
    /// published local interface address).
    pub fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// The recorded fatal reason, if processing has failed terminally.
    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    // ------------------------------------------------------------------
    // Processing entry points
    // ------------------------------------------------------------------

    /// Feed one received UDP datagram. Returns the next background-task
    /// deadline (absolute milliseconds).
    pub fn process_wire_packet(
        &self,
        now: i64,
        socket: LocalSocket,
        from: SocketAddr,
        data: &[u8],
    ) -> i64 {
        self.stats.wire_in.fetch_add(1, Ordering::Relaxed);
        let mut actions = Vec::new();
        let deadline;
        {
            let mut inner = self.inner.lock();
            match parse_envelope(data) {
                Ok(env) => {
                    if env.dest != self.identity.address() {
                        self.drop_packet("not addressed to us");
                    } else {
                        self.dispatch_wire(&mut inner, now, socket, from, &env, &mut actions);
                    }
                }
                Err(e) => {
                    trace!(%from, error = %e, "unparseable datagram");
                    self.drop_packet("parse error");
                }
            }
            deadline = self.compute_deadline(&inner, now);
        }
        self.run_actions(actions);
        deadline
    }

    /// Feed one outbound Ethernet frame from a virtual interface.
    pub fn process_virtual_frame(
        &self,
        now: i64,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        vlan: u16,
        data: &[u8],
    ) -> i64 {
        let mut actions = Vec::new();
        let deadline;
        {
            let mut inner = self.inner.lock();
            self.egress_frame(
                &mut inner, now, nwid, src_mac, dst_mac, ethertype, vlan, data, &mut actions,
            );
            deadline = self.compute_deadline(&inner, now);
        }
        self.run_actions(actions);
        deadline
    }

    /// Run timers: keepalives, path expiry, config re-requests, multicast
    /// gossip, peer persistence. Returns the next deadline, or a fatal
    /// error after an unrecoverable condition (the caller must shut down).
    pub fn process_background_tasks(&self, now: i64) -> Result<i64> {
        if self.fatal_flag.load(Ordering::Acquire) {
            let reason = self.fatal_reason().unwrap_or_else(|| "unknown".into());
            return Err(Error::fatal(reason));
        }
        let mut actions = Vec::new();
        let deadline;
        {
            let mut inner = self.inner.lock();

            let now_online = !inner.local_addrs.is_empty();
            if self.online.swap(now_online, Ordering::AcqRel) != now_online {
                let ev = if now_online { Event::NodeOnline } else { Event::NodeOffline };
                actions.push(Action::Event { event: ev, msg: None });
            }

            self.peer_maintenance(&mut inner, now, &mut actions);
            self.network_maintenance(&mut inner, now, &mut actions);

            deadline = self.compute_deadline(&inner, now);
        }
        self.run_actions(actions);
        Ok(deadline)
    }

    // ------------------------------------------------------------------
    // Membership operations
    // ------------------------------------------------------------------

    /// Join a network. Idempotent.
    pub fn join(&self, nwid: NetworkId, now: i64) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.networks.contains_key(&nwid) {
                return;
            }
            let membership = if nwid.adhoc_port_range().is_some() {
                Membership::new_adhoc(nwid, self.identity.address())
            } else {
                Membership::new_requesting(nwid, self.identity.address())
            };
            let up_now = membership.info.status == NetworkStatus::Ok;
            let info = membership.info.clone();
            inner.networks.insert(nwid, membership);
            if up_now {
                actions.push(Action::Config { nwid, op: ConfigOp::Up, info: Some(info) });
                inner.configured.insert(nwid, true);
            } else {
                inner.configured.insert(nwid, false);
                self.request_config(&mut inner, nwid, now, &mut actions);
            }
        }
        self.run_actions(actions);
    }

    /// Leave a network, destroying its virtual interface.
    pub fn leave(&self, nwid: NetworkId) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.networks.remove(&nwid).is_none() {
                return;
            }
            inner.configured.remove(&nwid);
            actions.push(Action::Config { nwid, op: ConfigOp::Destroy, info: None });
            actions.push(Action::StatePut {
                object: StateObject::NetworkConfig(nwid),
                data: Vec::new(),
            });
        }
        self.run_actions(actions);
    }

    /// All joined network IDs.
    pub fn networks(&self) -> Vec<NetworkId> {
        let mut ids: Vec<NetworkId> = self.inner.lock().networks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot one membership.
    pub fn network(&self, nwid: NetworkId) -> Option<NetworkInfo> {
        self.inner.lock().networks.get(&nwid).map(|m| m.info.clone())
    }

    /// Snapshot all peers, ordered by address. Path order within each peer
    /// is stable for the snapshot.
    pub fn peers(&self, now: i64) -> Vec<PeerInfo> {
        let inner = self.inner.lock();
        let mut out: Vec<PeerInfo> = inner.peers.values().map(|p| p.info(now)).collect();
        out.sort_by_key(|p| p.address);
        out
    }

    /// Subscribe the local interface to a multicast group.
    pub fn multicast_subscribe(&self, nwid: NetworkId, group: MulticastGroup, now: i64) {
        self.multicast_change(nwid, group, now, true);
    }

    /// Drop a multicast subscription.
    pub fn multicast_unsubscribe(&self, nwid: NetworkId, group: MulticastGroup, now: i64) {
        self.multicast_change(nwid, group, now, false);
    }

    /// Add a root-set reference. The root set contents are opaque here;
    /// orbiting only biases peer roles.
    pub fn orbit(&self, moon_id: u64, _moon_seed: u64) {
        let mut inner = self.inner.lock();
        if !inner.moons.contains(&moon_id) {
            inner.moons.push(moon_id);
        }
    }

    /// Remove a root-set reference.
    pub fn deorbit(&self, moon_id: u64) {
        self.inner.lock().moons.retain(|m| *m != moon_id);
    }

    /// Forget all published local interface addresses.
    pub fn clear_local_interface_addresses(&self) {
        let mut inner = self.inner.lock();
        inner.local_addrs.clear();
    }

    /// Publish one local interface address (bound or externally mapped).
    pub fn add_local_interface_address(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        if !inner.local_addrs.contains(&addr) {
            inner.local_addrs.push(addr);
        }
    }

    // ------------------------------------------------------------------
    // Wire ingress
    // ------------------------------------------------------------------

    fn dispatch_wire(
        &self,
        inner: &mut Inner,
        now: i64,
        socket: LocalSocket,
        from: SocketAddr,
        env: &wire::Envelope<'_>,
        actions: &mut Vec<Action>,
    ) {
        match env.verb {
            Verb::Hello => self.on_hello(inner, now, socket, from, env, actions),
            Verb::OkHello => self.on_ok_hello(inner, now, socket, from, env),
            Verb::Frame => self.on_frame(inner, now, socket, from, env, actions),
            Verb::Config => self.on_config(inner, now, env, actions),
            Verb::ConfigRequest => {
                // We are never a controller; nothing to serve.
                self.drop_packet("config request to non-controller");
            }
            Verb::MulticastLike => self.on_multicast_like(inner, now, socket, from, env),
        }
    }

    fn on_hello(
        &self,
        inner: &mut Inner,
        now: i64,
        socket: LocalSocket,
        from: SocketAddr,
        env: &wire::Envelope<'_>,
        actions: &mut Vec<Action>,
    ) {
        let hello: Hello = match wire::from_cbor(env.payload) {
            Ok(h) => h,
            Err(_) => return self.drop_packet("bad hello"),
        };
        let remote: Identity = match hello.identity.parse() {
            Ok(id) => id,
            Err(_) => return self.drop_packet("bad hello identity"),
        };
        if remote.address() != env.src {
            return self.drop_packet("hello identity/source mismatch");
        }
        if remote.address() == self.identity.address() {
            // Another node claims our address: unrecoverable.
            self.record_fatal("identity collision detected on the wire");
            actions.push(Action::Event { event: Event::NodeFatalError, msg: None });
            return;
        }
        if !self.host.path_check(remote.address(), socket, from) {
            return self.drop_packet("path vetoed");
        }
        let peer = match self.peer_entry(inner, &remote, now) {
            Some(p) => p,
            None => return self.drop_packet("key agreement failed"),
        };
        peer.version = Some(hello.version);
        if peer.learn_path(socket, from, now) {
            debug!(peer = %env.src, %from, "learned path from hello");
        }
        let counter = peer.next_counter();
        if let Some(p) = peer.best_path_mut(now) {
            p.last_send = now;
        }
        let reply = OkHello {
            identity: self.identity.to_public_blob(),
            echo_timestamp_ms: hello.timestamp_ms,
            version: VERSION,
            observed_addr: Some(from),
        };
        if let Ok(payload) = wire::to_cbor(&reply) {
            let pkt = encode_clear(
                Verb::OkHello,
                env.src,
                self.identity.address(),
                counter,
                &payload,
            );
            actions.push(Action::Send { socket: Some(socket), dest: from, data: pkt, ttl: 0 });
        }
    }

    fn on_ok_hello(
        &self,
        inner: &mut Inner,
        now: i64,
        socket: LocalSocket,
        from: SocketAddr,
        env: &wire::Envelope<'_>,
    ) {
        let Ok(ok) = wire::from_cbor::<OkHello>(env.payload) else {
            return self.drop_packet("bad ok(hello)");
        };
        let Ok(remote) = ok.identity.parse::<Identity>() else {
            return self.drop_packet("bad ok(hello) identity");
        };
        if remote.address() != env.src {
            return self.drop_packet("ok(hello) identity/source mismatch");
        }
        if !self.host.path_check(remote.address(), socket, from) {
            return self.drop_packet("path vetoed");
        }
        let Some(peer) = self.peer_entry(inner, &remote, now) else {
            return self.drop_packet("key agreement failed");
        };
        peer.version = Some(ok.version);
        let rtt = (now - ok.echo_timestamp_ms).max(0);
        peer.latency = (rtt / 2).min(i32::MAX as i64) as i32;
        peer.learn_path(socket, from, now);
    }

    fn on_frame(
        &self,
        inner: &mut Inner,
        now: i64,
        socket: LocalSocket,
        from: SocketAddr,
        env: &wire::Envelope<'_>,
        actions: &mut Vec<Action>,
    ) {
        let src = env.src;
        let Some(peer) = inner.peers.get_mut(&src) else {
            self.stats.unknown_peers.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Ok(payload) = peer.key.open(env) else {
            self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        peer.learn_path(socket, from, now);
        let Ok(frame) = FramePayload::decode(&payload) else {
            return self.drop_packet("bad frame payload");
        };
        let Some(membership) = inner.networks.get_mut(&frame.nwid) else {
            return self.drop_packet("frame for network we have not joined");
        };
        if membership.info.status != NetworkStatus::Ok {
            return self.drop_packet("frame while network not ok");
        }
        if !membership.frame_allowed(frame.ethertype, frame.data) {
            return self.drop_packet("frame refused by network filter");
        }
        if !membership.info.bridging_allowed
            && frame.src_mac != Mac::for_network(src, frame.nwid)
        {
            return self.drop_packet("spoofed source mac");
        }
        membership.members.insert(src);
        let our_mac = membership.info.mac;
        if !frame.dst_mac.is_multicast() && frame.dst_mac != our_mac {
            return self.drop_packet("unicast frame for someone else");
        }
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
        actions.push(Action::Deliver {
            nwid: frame.nwid,
            src_mac: frame.src_mac,
            dst_mac: frame.dst_mac,
            ethertype: frame.ethertype,
            vlan: frame.vlan,
            data: frame.data.to_vec(),
        });
    }

    fn on_config(
        &self,
        inner: &mut Inner,
        now: i64,
        env: &wire::Envelope<'_>,
        actions: &mut Vec<Action>,
    ) {
        let Some(peer) = inner.peers.get_mut(&env.src) else {
            self.stats.unknown_peers.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Ok(payload) = peer.key.open(env) else {
            self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        peer.last_heard = now;
        let Ok(config) = wire::from_cbor::<Config>(&payload) else {
            return self.drop_packet("bad config payload");
        };
        let nwid = config.nwid;
        if env.src != nwid.controller() {
            return self.drop_packet("config from non-controller");
        }
        let Some(membership) = inner.networks.get_mut(&nwid) else {
            return self.drop_packet("config for network we have not joined");
        };
        match config.reply {
            ConfigReply::Ok(mut info) => {
                // The controller does not know our derived MAC; keep ours.
                info.nwid = nwid;
                info.mac = membership.info.mac;
                info.status = NetworkStatus::Ok;
                membership.info = info.clone();
                let was_configured = inner.configured.insert(nwid, true).unwrap_or(false);
                let op = if was_configured { ConfigOp::Update } else { ConfigOp::Up };
                if let Ok(bytes) = wire::to_cbor(&info) {
                    actions.push(Action::StatePut {
                        object: StateObject::NetworkConfig(nwid),
                        data: bytes,
                    });
                }
                actions.push(Action::Config { nwid, op, info: Some(info) });
            }
            ConfigReply::NotFound => membership.info.status = NetworkStatus::NotFound,
            ConfigReply::AccessDenied => membership.info.status = NetworkStatus::AccessDenied,
            ConfigReply::ClientTooOld => membership.info.status = NetworkStatus::ClientTooOld,
        }
    }

    fn on_multicast_like(
        &self,
        inner: &mut Inner,
        now: i64,
        socket: LocalSocket,
        from: SocketAddr,
        env: &wire::Envelope<'_>,
    ) {
        let Some(peer) = inner.peers.get_mut(&env.src) else {
            self.stats.unknown_peers.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Ok(payload) = peer.key.open(env) else {
            self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        peer.learn_path(socket, from, now);
        let Ok(like) = wire::from_cbor::<MulticastLike>(&payload) else {
            return self.drop_packet("bad multicast like");
        };
        let Some(membership) = inner.networks.get_mut(&like.nwid) else {
            return;
        };
        membership.members.insert(env.src);
        for (mac, adi) in like.subscribed {
            membership
                .member_subs
                .entry(MulticastGroup { mac, adi })
                .or_default()
                .insert(env.src);
        }
        for (mac, adi) in like.unsubscribed {
            if let Some(set) = membership.member_subs.get_mut(&MulticastGroup { mac, adi }) {
                set.remove(&env.src);
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame egress
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn egress_frame(
        &self,
        inner: &mut Inner,
        now: i64,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        vlan: u16,
        data: &[u8],
        actions: &mut Vec<Action>,
    ) {
        let Some(membership) = inner.networks.get_mut(&nwid) else {
            return self.drop_packet("egress on unjoined network");
        };
        if membership.info.status != NetworkStatus::Ok {
            return self.drop_packet("egress while network not ok");
        }
        if !membership.frame_allowed(ethertype, data) {
            return self.drop_packet("egress refused by network filter");
        }

        // Neighbor solicitations for the deterministic v6 schemes are
        // answered locally; the target's MAC is computable from the
        // address, so no multicast needs to cross the overlay.
        if ethertype == crate::network::ethertype::IPV6 {
            if let Some(target) = crate::nd6::solicitation_target(data) {
                if let Some(owner) = crate::nd6::node_for_target(nwid, &target) {
                    if owner != self.identity.address() {
                        let target_mac = Mac::for_network(owner, nwid);
                        if let Some(reply) = crate::nd6::synthesize_advertisement(data, target_mac)
                        {
                            membership.members.insert(owner);
                            actions.push(Action::Deliver {
                                nwid,
                                src_mac: target_mac,
                                dst_mac: src_mac,
                                ethertype,
                                vlan: 0,
                                data: reply,
                            });
                            return;
                        }
                    }
                }
            }
        }

        let payload = FramePayload { nwid, src_mac, dst_mac, ethertype, vlan, data }.encode();

        let recipients: Vec<NodeId> = if dst_mac.is_multicast() {
            membership.multicast_recipients(&MulticastGroup { mac: dst_mac, adi: 0 })
        } else {
            vec![dst_mac.to_node(nwid)]
        };

        for dest in recipients {
            if dest == self.identity.address() {
                continue;
            }
            self.send_to_peer(inner, now, dest, Verb::Frame, &payload, actions);
        }
        self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Seal and queue a packet for `dest`, or begin first contact when the
    /// peer (or a path to it) is unknown. Frames lost during first contact
    /// are not retried here; transport protocols above retransmit.
    fn send_to_peer(
        &self,
        inner: &mut Inner,
        now: i64,
        dest: NodeId,
        verb: Verb,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) {
        let mut sealed: Option<Vec<u8>> = None;
        let mut route: Option<(LocalSocket, SocketAddr)> = None;
        let known = inner.peers.contains_key(&dest);
        if known {
            let Some(peer) = inner.peers.get_mut(&dest) else { return };
            let counter = peer.next_counter();
            match peer.key.seal(verb, dest, self.identity.address(), counter, payload) {
                Ok(pkt) => sealed = Some(pkt),
                Err(_) => return self.drop_packet("seal failed"),
            }
            if let Some(path) = peer.best_path_mut(now) {
                path.last_send = now;
                route = Some((path.socket, path.endpoint));
            }
        } else {
            self.stats.unknown_peers.fetch_add(1, Ordering::Relaxed);
        }

        match (sealed, route) {
            (Some(pkt), Some((socket, endpoint))) => {
                self.stats.wire_out.fetch_add(1, Ordering::Relaxed);
                actions.push(Action::Send {
                    socket: Some(socket),
                    dest: endpoint,
                    data: pkt,
                    ttl: 0,
                });
            }
            _ => {
                // No session or no live path: probe the configured hint on
                // every socket and let the HELLO exchange build the path.
                // The packet itself is not retried; transport protocols
                // above retransmit.
                if let Some(hint) = self
                    .host
                    .path_lookup(dest, false)
                    .or_else(|| self.host.path_lookup(dest, true))
                {
                    let hello = self.hello_packet_locked(inner, dest, now);
                    actions.push(Action::Send { socket: None, dest: hint, data: hello, ttl: 0 });
                }
                if known {
                    self.drop_packet("no live path");
                }
            }
        }
    }

    fn hello_packet_locked(&self, inner: &mut Inner, dest: NodeId, now: i64) -> Vec<u8> {
        // HELLO counters do not need a session; reuse the peer counter when
        // we have one so replays stay monotonic.
        let counter = inner
            .peers
            .get_mut(&dest)
            .map(|p| p.next_counter())
            .unwrap_or(now as u64);
        let hello = Hello {
            identity: self.identity.to_public_blob(),
            timestamp_ms: now,
            version: VERSION,
        };
        let payload = wire::to_cbor(&hello).unwrap_or_default();
        encode_clear(Verb::Hello, dest, self.identity.address(), counter, &payload)
    }

    // ------------------------------------------------------------------
    // Background maintenance
    // ------------------------------------------------------------------

    fn peer_maintenance(&self, inner: &mut Inner, now: i64, actions: &mut Vec<Action>) {
        let mut expired: Vec<NodeId> = Vec::new();
        let persist = now - inner.last_peer_persist >= PATH_KEEPALIVE_MS;

        let addresses: Vec<NodeId> = inner.peers.keys().copied().collect();
        for addr in addresses {
            let Some(peer) = inner.peers.get_mut(&addr) else { continue };
            peer.prune_paths(now);
            if now - peer.last_heard > PEER_EXPIRY_MS {
                expired.push(addr);
                continue;
            }
            if peer.role == PeerRole::Leaf && inner.moons.contains(&addr.0) {
                peer.role = PeerRole::Moon;
            }
            if now - peer.last_hello_sent >= PATH_KEEPALIVE_MS {
                peer.last_hello_sent = now;
                let endpoints: Vec<(LocalSocket, SocketAddr)> = peer
                    .paths
                    .iter()
                    .filter(|p| !p.expired(now))
                    .map(|p| (p.socket, p.endpoint))
                    .collect();
                if persist && !endpoints.is_empty() {
                    let eps: Vec<SocketAddr> = endpoints.iter().map(|(_, e)| *e).collect();
                    if let Ok(data) = wire::to_cbor(&eps) {
                        actions.push(Action::StatePut {
                            object: StateObject::Peer(addr),
                            data,
                        });
                    }
                }
                let hello = self.hello_packet_locked(inner, addr, now);
                for (socket, endpoint) in endpoints {
                    actions.push(Action::Send {
                        socket: Some(socket),
                        dest: endpoint,
                        data: hello.clone(),
                        ttl: 0,
                    });
                }
            }
        }
        if persist {
            inner.last_peer_persist = now;
        }
        for addr in expired {
            debug!(peer = %addr, "peer expired");
            inner.peers.remove(&addr);
        }
    }

    fn network_maintenance(&self, inner: &mut Inner, now: i64, actions: &mut Vec<Action>) {
        let nwids: Vec<NetworkId> = inner.networks.keys().copied().collect();
        for nwid in nwids {
            let (request_due, announce_due) = match inner.networks.get(&nwid) {
                Some(m) => (
                    m.info.status == NetworkStatus::RequestingConfig
                        && now - m.last_config_request >= CONFIG_REQUEST_INTERVAL_MS,
                    m.info.status == NetworkStatus::Ok
                        && !m.local_subs.is_empty()
                        && now - m.last_multicast_announce >= MULTICAST_ANNOUNCE_INTERVAL_MS,
                ),
                None => continue,
            };
            if request_due {
                self.request_config(inner, nwid, now, actions);
            }
            if announce_due {
                self.announce_multicast(inner, nwid, now, actions);
            }
        }
    }

    fn request_config(
        &self,
        inner: &mut Inner,
        nwid: NetworkId,
        now: i64,
        actions: &mut Vec<Action>,
    ) {
        if let Some(m) = inner.networks.get_mut(&nwid) {
            m.last_config_request = now;
        }
        let controller = nwid.controller();
        let request = ConfigRequest { nwid, timestamp_ms: now };
        let Ok(payload) = wire::to_cbor(&request) else { return };
        self.send_to_peer(inner, now, controller, Verb::ConfigRequest, &payload, actions);
    }

    fn announce_multicast(
        &self,
        inner: &mut Inner,
        nwid: NetworkId,
        now: i64,
        actions: &mut Vec<Action>,
    ) {
        let subscribed = {
            let Some(m) = inner.networks.get_mut(&nwid) else { return };
            m.last_multicast_announce = now;
            m.local_subs.iter().map(|g| (g.mac, g.adi)).collect::<Vec<_>>()
        };
        let like = MulticastLike { nwid, subscribed, unsubscribed: Vec::new() };
        let Ok(payload) = wire::to_cbor(&like) else { return };
        // Gossip to every peer, not just known members: the LIKE itself
        // is how members discover each other after first contact
        let peers: Vec<NodeId> = inner.peers.keys().copied().collect();
        for peer in peers {
            self.send_to_peer(inner, now, peer, Verb::MulticastLike, &payload, actions);
        }
    }

    fn multicast_change(&self, nwid: NetworkId, group: MulticastGroup, now: i64, add: bool) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let changed = {
                let Some(m) = inner.networks.get_mut(&nwid) else { return };
                if add {
                    m.local_subs.insert(group)
                } else {
                    m.local_subs.remove(&group)
                }
            };
            let members: Vec<NodeId> = inner.peers.keys().copied().collect();
            if changed {
                let like = if add {
                    MulticastLike {
                        nwid,
                        subscribed: vec![(group.mac, group.adi)],
                        unsubscribed: Vec::new(),
                    }
                } else {
                    MulticastLike {
                        nwid,
                        subscribed: Vec::new(),
                        unsubscribed: vec![(group.mac, group.adi)],
                    }
                };
                if let Ok(payload) = wire::to_cbor(&like) {
                    for member in members {
                        self.send_to_peer(
                            &mut inner,
                            now,
                            member,
                            Verb::MulticastLike,
                            &payload,
                            &mut actions,
                        );
                    }
                }
            }
        }
        self.run_actions(actions);
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn peer_entry<'a>(
        &self,
        inner: &'a mut Inner,
        remote: &Identity,
        now: i64,
    ) -> Option<&'a mut Peer> {
        let addr = remote.address();
        if !inner.peers.contains_key(&addr) {
            let shared = self.identity.agree(remote.public_key()).ok()?;
            let key = SessionKey::derive(&shared, self.identity.address(), addr);
            inner.peers.insert(addr, Peer::new(addr, key, now));
        }
        inner.peers.get_mut(&addr)
    }

    fn compute_deadline(&self, inner: &Inner, now: i64) -> i64 {
        let mut deadline = now + PATH_KEEPALIVE_MS;
        for peer in inner.peers.values() {
            deadline = deadline.min(peer.last_hello_sent + PATH_KEEPALIVE_MS);
        }
        for m in inner.networks.values() {
            if m.info.status == NetworkStatus::RequestingConfig {
                deadline = deadline.min(m.last_config_request + CONFIG_REQUEST_INTERVAL_MS);
            }
            if m.info.status == NetworkStatus::Ok && !m.local_subs.is_empty() {
                deadline = deadline.min(m.last_multicast_announce + MULTICAST_ANNOUNCE_INTERVAL_MS);
            }
        }
        deadline.max(now + 1)
    }

    fn drop_packet(&self, reason: &'static str) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(reason, "dropped");
    }

    fn record_fatal(&self, reason: &str) {
        warn!(reason, "fatal node error");
        *self.fatal.lock() = Some(reason.to_string());
        self.fatal_flag.store(true, Ordering::Release);
    }

    fn run_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { socket, dest, data, ttl } => {
                    if !self.host.wire_packet_send(socket, dest, &data, ttl) {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Action::Deliver { nwid, src_mac, dst_mac, ethertype, vlan, data } => {
                    self.host
                        .virtual_network_frame(nwid, src_mac, dst_mac, ethertype, vlan, &data);
                }
                Action::Config { nwid, op, info } => {
                    self.host.virtual_network_config(nwid, op, info.as_ref());
                }
                Action::StatePut { object, data } => {
                    self.host.state_put(object, &data);
                }
                Action::Event { event, msg } => {
                    self.host.event(event, msg.as_ref());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct TestHost {
        sent: PlMutex<Vec<(Option<LocalSocket>, SocketAddr, Vec<u8>)>>,
        delivered: PlMutex<Vec<(NetworkId, Mac, Mac, u16, Vec<u8>)>>,
        configs: PlMutex<Vec<(NetworkId, ConfigOp)>>,
        store: PlMutex<HashMap<String, Vec<u8>>>,
        events: PlMutex<Vec<Event>>,
        hints: PlMutex<HashMap<NodeId, SocketAddr>>,
        vetoes: AtomicUsize,
    }

    impl TestHost {
        fn key(object: StateObject) -> String {
            format!("{object:?}")
        }
    }

    impl NodeHost for TestHost {
        fn virtual_network_config(
            &self,
            nwid: NetworkId,
            op: ConfigOp,
            _info: Option<&NetworkInfo>,
        ) {
            self.configs.lock().push((nwid, op));
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
            self.delivered
                .lock()
                .push((nwid, src_mac, dst_mac, ethertype, data.to_vec()));
        }
        fn wire_packet_send(
            &self,
            socket: Option<LocalSocket>,
            dest: SocketAddr,
            data: &[u8],
            _ttl: u8,
        ) -> bool {
            self.sent.lock().push((socket, dest, data.to_vec()));
            true
        }
        fn path_check(&self, _peer: NodeId, _socket: LocalSocket, _addr: SocketAddr) -> bool {
            self.vetoes.load(Ordering::Relaxed) == 0
        }
        fn path_lookup(&self, peer: NodeId, _want_v6: bool) -> Option<SocketAddr> {
            self.hints.lock().get(&peer).copied()
        }
        fn state_put(&self, object: StateObject, data: &[u8]) {
            self.store.lock().insert(Self::key(object), data.to_vec());
        }
        fn state_get(&self, object: StateObject) -> Option<Vec<u8>> {
            self.store.lock().get(&Self::key(object)).cloned()
        }
        fn event(&self, event: Event, _msg: Option<&EventMessage>) {
            self.events.lock().push(event);
        }
    }

    fn make_node() -> (Arc<TestHost>, Node) {
        let host = Arc::new(TestHost::default());
        let node = Node::new(host.clone()).unwrap();
        (host, node)
    }

    fn sa(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 7], port))
    }

    #[test]
    fn identity_is_persisted_and_reloaded() {
        let (host, node) = make_node();
        let addr = node.address();
        drop(node);
        let node2 = Node::new(host).unwrap();
        assert_eq!(node2.address(), addr);
    }

    #[test]
    fn corrupt_identity_is_fatal() {
        let host = Arc::new(TestHost::default());
        host.state_put(StateObject::IdentitySecret, b"not an identity");
        assert!(Node::new(host).is_err());
    }

    #[test]
    fn hello_exchange_builds_peers_both_ways() {
        let (host_a, a) = make_node();
        let (host_b, b) = make_node();
        let now = 1_000;

        // b hears a's HELLO
        let mut inner = a.inner.lock();
        let hello = a.hello_packet_locked(&mut inner, b.address(), now);
        drop(inner);
        b.process_wire_packet(now, LocalSocket(1), sa(1111), &hello);
        assert_eq!(b.peers(now).len(), 1);
        assert_eq!(b.peers(now)[0].address, a.address());
        assert_eq!(b.peers(now)[0].paths.len(), 1);

        // a hears b's OK(HELLO)
        let reply = host_b.sent.lock().last().unwrap().2.clone();
        a.process_wire_packet(now + 20, LocalSocket(2), sa(2222), &reply);
        assert_eq!(a.peers(now + 20).len(), 1);
        assert!(a.peers(now + 20)[0].latency >= 0);
        assert_eq!(host_a.sent.lock().len(), 0);
    }

    #[test]
    fn adhoc_join_reports_up_immediately() {
        let (host, node) = make_node();
        let nwid = NetworkId::adhoc(8000, 8000);
        node.join(nwid, 1_000);
        let configs = host.configs.lock();
        assert_eq!(configs.as_slice(), &[(nwid, ConfigOp::Up)]);
        drop(configs);
        let info = node.network(nwid).unwrap();
        assert_eq!(info.status, NetworkStatus::Ok);
        assert!(info.assigned_addrs[0].0.is_ipv6());
        // Leaving destroys
        node.leave(nwid);
        assert_eq!(host.configs.lock().last().unwrap().1, ConfigOp::Destroy);
        assert!(node.network(nwid).is_none());
    }

    #[test]
    fn controller_network_requests_config() {
        let (host, node) = make_node();
        let nwid = NetworkId(0x8056c2e21c000001);
        let controller = nwid.controller();
        host.hints.lock().insert(controller, sa(9993));
        node.join(nwid, 1_000);
        assert_eq!(node.network(nwid).unwrap().status, NetworkStatus::RequestingConfig);
        // With no session to the controller yet, first contact is a HELLO
        // broadcast at the hint address.
        let sent = host.sent.lock();
        assert!(!sent.is_empty());
        assert_eq!(sent[0].1, sa(9993));
        assert!(sent[0].0.is_none());
    }

    #[test]
    fn frame_round_trip_between_two_nodes() {
        let (host_a, a) = make_node();
        let (host_b, b) = make_node();
        let nwid = NetworkId::adhoc(8000, 8100);
        let now = 1_000;
        a.join(nwid, now);
        b.join(nwid, now);

        // Handshake: b processes a's hello, a processes b's ok
        let mut inner = a.inner.lock();
        let hello = a.hello_packet_locked(&mut inner, b.address(), now);
        drop(inner);
        b.process_wire_packet(now, LocalSocket(1), sa(1111), &hello);
        let ok = host_b.sent.lock().last().unwrap().2.clone();
        a.process_wire_packet(now, LocalSocket(1), sa(2222), &ok);
        // And the reverse direction so both have sessions
        let mut inner = b.inner.lock();
        let hello_b = b.hello_packet_locked(&mut inner, a.address(), now);
        drop(inner);
        a.process_wire_packet(now, LocalSocket(1), sa(2222), &hello_b);

        // a sends an ipv6 udp frame to b's mac
        let a_mac = Mac::for_network(a.address(), nwid);
        let b_mac = Mac::for_network(b.address(), nwid);
        let mut ip6 = vec![0u8; 48];
        ip6[0] = 0x60;
        ip6[6] = 17; // udp
        ip6[42] = (8050u16 >> 8) as u8;
        ip6[43] = (8050u16 & 0xff) as u8;
        host_a.sent.lock().clear();
        a.process_virtual_frame(now + 10, nwid, a_mac, b_mac, 0x86dd, 0, &ip6);
        let wire_pkt = host_a.sent.lock().last().cloned().unwrap();

        // b receives it and delivers up its stack
        b.process_wire_packet(now + 20, LocalSocket(1), sa(2222), &wire_pkt.2);
        let delivered = host_b.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, nwid);
        assert_eq!(delivered[0].1, a_mac);
        assert_eq!(delivered[0].2, b_mac);
        assert_eq!(delivered[0].4, ip6);
    }

    #[test]
    fn out_of_range_adhoc_frame_is_dropped() {
        let (host_a, a) = make_node();
        let (_, b) = make_node();
        let nwid = NetworkId::adhoc(8000, 8000);
        let now = 1_000;
        a.join(nwid, now);
        let a_mac = Mac::for_network(a.address(), nwid);
        let b_mac = Mac::for_network(b.address(), nwid);
        let mut ip6 = vec![0u8; 48];
        ip6[0] = 0x60;
        ip6[6] = 17;
        ip6[42] = (9999u16 >> 8) as u8;
        ip6[43] = (9999u16 & 0xff) as u8;
        a.process_virtual_frame(now, nwid, a_mac, b_mac, 0x86dd, 0, &ip6);
        assert!(host_a.sent.lock().is_empty());
        assert!(a.stats().dropped.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn online_follows_local_addresses() {
        let (host, node) = make_node();
        assert!(!node.online());
        node.add_local_interface_address(sa(40000));
        node.process_background_tasks(1_000).unwrap();
        assert!(node.online());
        assert_eq!(host.events.lock().as_slice(), &[Event::NodeOnline]);
        node.clear_local_interface_addresses();
        node.process_background_tasks(2_000).unwrap();
        assert!(!node.online());
    }

    #[test]
    fn deadline_is_always_in_the_future() {
        let (_, node) = make_node();
        let d = node.process_background_tasks(5_000).unwrap();
        assert!(d > 5_000);
    }
}
