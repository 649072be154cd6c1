use std::io;

use thiserror::Error;

use crate::epoll_ref::RefError;

pub type Result<T> = std::result::Result<T, TcpError>;

/// Per-flow failures.
///
/// None of these are fatal to the process: the engine handles every variant inside the dispatch
/// call that produced it (rejecting or aborting the affected flow) and only counts/logs it.
#[derive(Debug, Error)]
pub enum TcpError {
    #[error("connection table exhausted")]
    TableExhausted,

    #[error("no forwarding rule permits this flow")]
    RuleDenied,

    #[error("host peer reset the connection")]
    PeerReset,

    #[error("guest reset the connection")]
    TapReset,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("bridge shutting down")]
    Shutdown,

    #[error("host socket error: {0}")]
    PeerError(#[source] io::Error),

    #[error("connect to host endpoint failed: {0}")]
    HostConnectFailure(#[source] io::Error),

    #[error("malformed segment: {0}")]
    MalformedSegment(&'static str),

    #[error("splice resources unavailable: {0}")]
    ResourceAllocationFailure(#[source] io::Error),

    #[error("no live connection at index {0}")]
    InvalidIndex(u32),

    #[error("invalid event reference: {0}")]
    InvalidRef(#[from] RefError),
}

impl TcpError {
    /// Whether the guest should see a reset for the flow that produced this error. A reset the
    /// guest sent itself is only passed on to the host socket.
    pub fn wants_reset(&self) -> bool {
        !matches!(
            self,
            TcpError::TapReset
                | TcpError::MalformedSegment(_)
                | TcpError::InvalidIndex(_)
                | TcpError::InvalidRef(_)
        )
    }

    pub(crate) fn from_sock(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => TcpError::PeerReset,
            _ => TcpError::PeerError(err),
        }
    }
}
