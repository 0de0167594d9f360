#![forbid(unsafe_code)]

//! The in-process TCP/IP stack.
//!
//! One dedicated OS thread owns every virtual interface and runs the
//! cooperative poll loop; all other threads marshal their work through the
//! core lock. On top of the driver sits a BSD-style socket layer with
//! integer file descriptors, blocking and non-blocking modes, per-socket
//! timeouts and a thread-local errno.
//!
//! The stack starts at most once per process and a stop is terminal: the
//! lifecycle latch refuses any later start, mirroring the restrictions of
//! embedded TCP/IP cores whose pools cannot be re-created.

pub mod device;
pub mod driver;
pub mod errno;
pub mod sockets;
pub mod stats;

pub use device::FrameSink;
pub use driver::{NetifId, StackDriver, StackPhase};
pub use errno::{errno, Errno};
pub use sockets::{
    FdSet, PollEvents, PollFd, SockAddr, SocketLayer, AF_INET, AF_INET6, SOCK_DGRAM, SOCK_RAW,
    SOCK_STREAM,
};
pub use stats::{LayerStats, StackStats};
