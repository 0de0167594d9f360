#![forbid(unsafe_code)]

//! Service orchestration for the ZeroLink data plane.
//!
//! [`Service`] wires the overlay node, the userspace TCP/IP stack, the
//! UDP binder and the event bus together and drives the periodic
//! maintenance loop: bind refresh, multicast group sync, peer and
//! network status change detection, background task servicing, cache
//! cleanup. The embedding application talks to the service through the
//! SDK crate; everything here is the machinery behind that surface.

pub mod binder;
pub mod events;
pub mod portmap;
pub mod service;
pub mod storage;
pub mod tap;

pub use events::{EventBus, EventHandler};
pub use service::{Service, ServiceState};
pub use storage::{FileStorage, MemStorage, Storage};
