#![forbid(unsafe_code)]

//! The overlay node: authenticated sessions with other nodes, path
//! learning, frame encryption and virtual-network membership.
//!
//! The node is deliberately inert. It never owns a socket, a thread or a
//! timer; the service orchestrator feeds it wire packets and outbound
//! Ethernet frames and polls its background tasks, and the node calls back
//! out through [`NodeHost`] for everything that touches the outside world.
//! Every processing entry point returns the absolute deadline by which
//! background tasks must run again.

pub mod identity;
pub mod nd6;
pub mod network;
pub mod node;
pub mod peer;
pub mod wire;

pub use identity::Identity;
pub use node::{ConfigOp, LocalSocket, Node, NodeHost, NodeStats, StateObject};

/// Library version reported in HELLOs and node details.
pub const VERSION: (u16, u16, u16) = (1, 0, 0);
