//! Thread-local errno for the socket layer.
//!
//! Socket calls return negative codes and leave the detail here, exactly
//! as a libc surface would, so applications written against BSD sockets
//! port over without restructuring their error handling. Values follow
//! the common Linux numbering but are namespaced; they are this library's
//! own contract, not the host's.

use std::cell::Cell;

/// Namespace for the POSIX-style error numbers used by the socket layer.
#[allow(missing_docs)]
pub struct Errno;

#[allow(missing_docs)]
impl Errno {
    pub const EPERM: i32 = 1;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    /// Alias of [`Self::EAGAIN`].
    pub const EWOULDBLOCK: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EINVAL: i32 = 22;
    pub const ENFILE: i32 = 23;
    pub const EMFILE: i32 = 24;
    pub const EPIPE: i32 = 32;
    pub const ENOTSOCK: i32 = 88;
    pub const EDESTADDRREQ: i32 = 89;
    pub const EMSGSIZE: i32 = 90;
    pub const EPROTONOSUPPORT: i32 = 93;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EAFNOSUPPORT: i32 = 97;
    pub const EADDRINUSE: i32 = 98;
    pub const EADDRNOTAVAIL: i32 = 99;
    pub const ENETDOWN: i32 = 100;
    pub const ENETUNREACH: i32 = 101;
    pub const ECONNRESET: i32 = 104;
    pub const EISCONN: i32 = 106;
    pub const ENOTCONN: i32 = 107;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const EHOSTUNREACH: i32 = 113;
    pub const EALREADY: i32 = 114;
    pub const EINPROGRESS: i32 = 115;
}

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// The calling thread's last socket error.
pub fn errno() -> i32 {
    ERRNO.with(|e| e.get())
}

/// Set the calling thread's errno. Public so the service layer can report
/// network-down conditions through the same channel.
pub fn set_errno(v: i32) {
    ERRNO.with(|e| e.set(v));
}

/// Clear errno (done on successful calls, like BSD does not, but keeping a
/// stale value has confused every generation of socket programmers; our
/// calls only *set* it on failure, matching POSIX).
pub fn clear_errno() {
    set_errno(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_thread_local() {
        set_errno(Errno::EAGAIN);
        assert_eq!(errno(), Errno::EAGAIN);
        let handle = std::thread::spawn(|| errno());
        assert_eq!(handle.join().ok(), Some(0));
        clear_errno();
        assert_eq!(errno(), 0);
    }

    #[test]
    fn ewouldblock_is_eagain() {
        assert_eq!(Errno::EWOULDBLOCK, Errno::EAGAIN);
    }
}
