//! The operating-system seam.
//!
//! The engine never touches a file descriptor directly: every socket, pipe, splice and event-loop
//! registration goes through [`HostIo`]. The daemon implements it on top of Linux syscalls; the
//! integration tests implement it in memory.
//!
//! All operations are non-blocking. "Nothing to do right now" is reported as
//! [`io::ErrorKind::WouldBlock`].

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use bitflags::bitflags;

bitflags! {
    /// Readiness the engine wants to be told about for a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Readiness reported by the event loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Events: u8 {
        const IN = 1 << 0;
        const OUT = 1 << 1;
        /// Peer closed both directions.
        const HUP = 1 << 2;
        /// Peer closed its sending direction.
        const RDHUP = 1 << 3;
        const ERR = 1 << 4;
    }
}

/// A pipe used to move bytes between two sockets without copying them to userspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipe {
    pub read: RawFd,
    pub write: RawFd,
}

/// Send-side state of a connected socket, as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockWindow {
    /// Peer's receive window as last seen by the kernel (`tcpi_snd_wnd`), when reported.
    pub snd_wnd: Option<u32>,
    /// Bytes written but not yet sent (`SIOCOUTQNSD`).
    pub unsent: u32,
    /// Total bytes queued in the send buffer, sent or not (`SIOCOUTQ`).
    pub queued: u32,
    /// Send buffer size (`SO_SNDBUF`).
    pub sndbuf: u32,
}

impl SockWindow {
    /// Bytes the socket can take before writes would block.
    pub fn sndbuf_free(&self) -> u32 {
        self.sndbuf.saturating_sub(self.queued)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            AddrFamily::V4
        } else {
            AddrFamily::V6
        }
    }
}

pub trait HostIo {
    /// Start a non-blocking connect, in the guest namespace when `ns` is set. Returns the socket
    /// and whether the connection completed immediately.
    fn connect(&mut self, dst: SocketAddr, ns: bool) -> io::Result<(RawFd, bool)>;

    /// Pending socket error (`SO_ERROR`), consumed by the call.
    fn take_error(&mut self, fd: RawFd) -> io::Result<Option<io::Error>>;

    fn listen(&mut self, addr: SocketAddr, ns: bool) -> io::Result<RawFd>;

    /// Accept one pending connection; `Ok(None)` once the backlog is empty.
    fn accept(&mut self, fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>>;

    /// Read into `buf`. `Ok(0)` means end of stream.
    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize>;

    fn shutdown_write(&mut self, fd: RawFd) -> io::Result<()>;

    /// Close the descriptor, dropping any event-loop registration with it.
    fn close(&mut self, fd: RawFd);

    /// Abortive close: `SO_LINGER {on, 0}` then close, so the peer sees a reset.
    fn reset(&mut self, fd: RawFd);

    fn window(&mut self, fd: RawFd) -> io::Result<SockWindow>;

    /// Request large (`true`) or default kernel buffers on a fresh socket. Best effort.
    fn set_bufsize(&mut self, fd: RawFd, large: bool);

    fn pipe(&mut self, size: usize) -> io::Result<Pipe>;

    /// Move up to `len` bytes from `from` to `to` with `splice(2)`. One end is always a pipe.
    /// `more` hints that further data follows immediately.
    fn splice(&mut self, from: RawFd, to: RawFd, len: usize, more: bool) -> io::Result<usize>;

    /// Whether the kernel reports a usable `tcpi_snd_wnd`.
    fn probe_snd_wnd(&mut self) -> bool;

    fn watch(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()>;

    fn rewatch(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()>;

    fn unwatch(&mut self, fd: RawFd);
}

/// Mirrors routes and addresses of the host's external interface into the guest namespace, so
/// that namespace-side listeners and connects behave like their init-namespace counterparts.
pub trait RouteMirror {
    /// Index of the interface carrying the default route for `family`, in the guest namespace
    /// when `ns` is set.
    fn lookup_interface(&mut self, family: AddrFamily, ns: bool) -> io::Result<u32>;

    fn duplicate_route(&mut self, src: u32, dst: u32, family: AddrFamily) -> io::Result<()>;

    fn duplicate_address(&mut self, src: u32, dst: u32, family: AddrFamily) -> io::Result<()>;
}

/// A [`RouteMirror`] for setups without a guest namespace.
#[derive(Debug, Default)]
pub struct NoMirror;

impl RouteMirror for NoMirror {
    fn lookup_interface(&mut self, _family: AddrFamily, _ns: bool) -> io::Result<u32> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn duplicate_route(&mut self, _src: u32, _dst: u32, _family: AddrFamily) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn duplicate_address(&mut self, _src: u32, _dst: u32, _family: AddrFamily) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
