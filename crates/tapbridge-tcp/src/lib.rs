#![forbid(unsafe_code)]

//! TCP connection tracking between a tap device and host sockets.
//!
//! [`TcpEngine`] owns every connection record and is driven by four kinds of input: segments
//! from the tap, readiness events for host sockets, the periodic timer, and the deferred
//! handler run at the end of each event batch. All I/O goes through [`HostIo`] and [`TapIo`], so
//! the engine itself never blocks and never touches the operating system directly.

pub mod config;
pub mod conn;
pub mod ctx;
mod engine;
pub mod epoll_ref;
pub mod error;
mod flow;
pub mod fwd;
pub mod hash;
pub mod host;
pub mod listen;
pub mod packet;
mod splice;
pub mod stats;
pub mod table;
pub mod tap;
pub mod timer;

pub use config::TcpConfig;
pub use conn::{ConnFlags, Flow, Origin, Phase, SpliceConn, TapConn};
pub use engine::TcpEngine;
pub use epoll_ref::{EpollRef, RefError, RefKind, Side};
pub use error::TcpError;
pub use flow::WS_TO_TAP;
pub use fwd::{FwdDirection, FwdMode, FwdParseError, FwdTarget, PortFwd};
pub use hash::{FlowKey, HashSecret};
pub use host::{AddrFamily, Events, HostIo, Interest, NoMirror, Pipe, RouteMirror, SockWindow};
pub use splice::MAX_PIPE_SIZE;
pub use stats::TcpStats;
pub use tap::{Capture, TapFrame, TapIo};

/// Milliseconds on the caller's monotonic clock.
pub type Millis = u64;

/// Bits of an event reference used for the connection index.
pub const TCP_CONN_INDEX_BITS: u32 = 17;

/// Upper bound on live connection records; indices are always below it.
pub const TCP_MAX_CONNS: u32 = (1 << TCP_CONN_INDEX_BITS) - 1;
