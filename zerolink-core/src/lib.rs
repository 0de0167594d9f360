#![forbid(unsafe_code)]

//! Core vocabulary of the ZeroLink virtual-network library.
//!
//! Everything here is passive data: identifiers, event codes, limits,
//! configuration and the pure IPv6 address derivations. The moving parts
//! (overlay node, userspace stack, service orchestrator) live in the
//! sibling crates and all speak in these types.

pub mod config;
pub mod error;
pub mod events;
pub mod ipv6;
pub mod types;

pub use config::ServiceConfig;
pub use error::{Error, ReturnCode, Result};
pub use events::{Event, EventMessage};
pub use types::{
    cidr_contains, scope_of, InetScope, Mac, MulticastGroup, NetworkId, NetworkInfo,
    NetworkStatus, NodeId, PathInfo, PeerInfo, PeerRole, VirtRoute,
};

/// Maximum number of addresses the controller may assign to one network.
pub const MAX_ASSIGNED_ADDRS: usize = 16;
/// Maximum number of pushed routes per network.
pub const MAX_ROUTES: usize = 32;
/// Maximum number of multicast subscriptions per virtual interface.
pub const MAX_MULTICAST_GROUPS: usize = 1024;
/// Maximum number of concurrently tracked paths per peer.
pub const MAX_PEER_PATHS: usize = 16;
/// Largest virtual-network MTU we will configure on a netif.
pub const MAX_MTU: usize = 2800;
/// Default virtual-network MTU when the controller does not specify one.
pub const DEFAULT_MTU: usize = 2800;
