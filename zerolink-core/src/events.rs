//! Event codes and the messages carried to the user's handler.
//!
//! Numeric values are part of the public contract: applications match on
//! them across library versions and language wrappers, so they are assigned
//! explicitly and never reused.

use crate::types::{Mac, NetworkId, NetworkInfo, NodeId, PeerInfo, VirtRoute};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Everything the library reports asynchronously.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    NodeUp = 200,
    NodeOnline = 201,
    NodeOffline = 202,
    NodeDown = 203,
    /// Identity collision or another unrecoverable node fault. The service
    /// shuts down after publishing this.
    NodeFatalError = 204,

    NetworkNotFound = 210,
    NetworkClientTooOld = 211,
    NetworkRequestingConfig = 212,
    NetworkOk = 213,
    NetworkAccessDenied = 214,
    NetworkReadyIp4 = 215,
    NetworkReadyIp6 = 216,
    NetworkReadyIp4Ip6 = 217,
    NetworkDown = 218,
    NetworkUpdate = 219,

    StackUp = 220,
    StackDown = 221,

    NetifUp = 230,
    NetifDown = 231,
    NetifRemoved = 232,
    NetifLinkUp = 233,
    NetifLinkDown = 234,

    PeerDirect = 240,
    PeerRelay = 241,
    PeerUnreachable = 242,
    PeerPathDiscovered = 243,
    PeerPathDead = 244,

    RouteAdded = 250,
    RouteRemoved = 251,

    AddrAddedIp4 = 260,
    AddrRemovedIp4 = 261,
    AddrAddedIp6 = 262,
    AddrRemovedIp6 = 263,

    StoreIdentitySecret = 270,
    StoreIdentityPublic = 271,
    StorePlanet = 272,
    StorePeer = 273,
    StoreNetwork = 274,
}

/// Node-level details attached to node lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetails {
    pub address: NodeId,
    pub primary_port: u16,
    /// Library version as (major, minor, revision).
    pub version: (u16, u16, u16),
}

/// Netif details attached to netif lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetifDetails {
    pub nwid: NetworkId,
    pub mac: Mac,
    pub mtu: usize,
}

/// Address assignment details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrDetails {
    pub nwid: NetworkId,
    pub addr: SocketAddr,
}

/// An event plus whatever detail payload accompanies it. Payloads are
/// snapshots by value; handlers never observe live library state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: Event,
    pub node: Option<NodeDetails>,
    pub network: Option<NetworkInfo>,
    pub netif: Option<NetifDetails>,
    pub route: Option<VirtRoute>,
    pub peer: Option<PeerInfo>,
    pub addr: Option<AddrDetails>,
}

impl EventMessage {
    /// A bare event with no payload.
    pub fn bare(event: Event) -> Self {
        Self {
            event,
            node: None,
            network: None,
            netif: None,
            route: None,
            peer: None,
            addr: None,
        }
    }

    pub fn with_node(event: Event, node: NodeDetails) -> Self {
        Self { node: Some(node), ..Self::bare(event) }
    }

    pub fn with_network(event: Event, network: NetworkInfo) -> Self {
        Self { network: Some(network), ..Self::bare(event) }
    }

    pub fn with_netif(event: Event, netif: NetifDetails) -> Self {
        Self { netif: Some(netif), ..Self::bare(event) }
    }

    pub fn with_route(event: Event, route: VirtRoute) -> Self {
        Self { route: Some(route), ..Self::bare(event) }
    }

    pub fn with_peer(event: Event, peer: PeerInfo) -> Self {
        Self { peer: Some(peer), ..Self::bare(event) }
    }

    pub fn with_addr(event: Event, addr: AddrDetails) -> Self {
        Self { addr: Some(addr), ..Self::bare(event) }
    }
}
