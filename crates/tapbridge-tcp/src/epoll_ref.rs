//! Event references: the opaque 64-bit token stored in the event loop for every watched fd.
//!
//! ```text
//!  63                               32 31    28 27                     4 3      0
//! +-----------------------------------+--------+------------------------+--------+
//! |              payload              |  zero  |           fd           |  kind  |
//! +-----------------------------------+--------+------------------------+--------+
//! ```
//!
//! Payload layout depends on the kind:
//! - `Tcp`: connection index (bits 0..17) and socket side (bit 17).
//! - `TcpListen`: forwarded-to port (bits 0..16) and namespace flag (bit 16).
//! - `Tap`, `Timer`, `Signal`: zero.
//!
//! Encoding and decoding are pure. Any token produced by [`EpollRef::encode`] decodes back to the
//! same value, and any token [`EpollRef::decode`] accepts re-encodes to itself.

use std::os::fd::RawFd;

use thiserror::Error;

use crate::{TCP_CONN_INDEX_BITS, TCP_MAX_CONNS};

/// Bits available for the file descriptor.
pub const FD_REF_BITS: u32 = 24;
/// Largest descriptor that fits in a reference.
pub const FD_REF_MAX: RawFd = (1 << FD_REF_BITS) - 1;

const KIND_BITS: u32 = 4;
const KIND_MASK: u64 = (1 << KIND_BITS) - 1;
const FD_SHIFT: u32 = KIND_BITS;
const FD_MASK: u64 = (1 << FD_REF_BITS) - 1;
const RESERVED_MASK: u64 = 0xf000_0000;
const PAYLOAD_SHIFT: u32 = 32;

const INDEX_MASK: u32 = (1 << TCP_CONN_INDEX_BITS) - 1;
const SIDE_BIT: u32 = 1 << TCP_CONN_INDEX_BITS;
const NS_BIT: u32 = 1 << 16;

const KIND_TAP: u64 = 1;
const KIND_TIMER: u64 = 2;
const KIND_SIGNAL: u64 = 3;
const KIND_TCP: u64 = 4;
const KIND_TCP_LISTEN: u64 = 5;

/// Which of a connection's sockets a reference points at.
///
/// Tap-side connections own a single host socket (`Primary`). Spliced connections own two: the
/// accepted socket (`Primary`) and the socket connected on the other side of the namespace
/// boundary (`Secondary`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Primary,
    Secondary,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Primary => Side::Secondary,
            Side::Secondary => Side::Primary,
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            Side::Primary => 0,
            Side::Secondary => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    Tap,
    Timer,
    Signal,
    Tcp { index: u32, side: Side },
    /// `port` is the port connections are forwarded *to* (listening port plus delta).
    TcpListen { port: u16, ns: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpollRef {
    pub kind: RefKind,
    pub fd: RawFd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RefError {
    #[error("unknown reference kind {0}")]
    UnknownKind(u8),
    #[error("reserved bits set in reference {0:#018x}")]
    ReservedBits(u64),
    #[error("file descriptor {0} does not fit in a reference")]
    FdOutOfRange(RawFd),
    #[error("connection index {0} out of range")]
    IndexOutOfRange(u32),
}

impl EpollRef {
    pub fn new(kind: RefKind, fd: RawFd) -> Self {
        Self { kind, fd }
    }

    pub fn tcp(index: u32, side: Side, fd: RawFd) -> Self {
        Self::new(RefKind::Tcp { index, side }, fd)
    }

    pub fn listen(port: u16, ns: bool, fd: RawFd) -> Self {
        Self::new(RefKind::TcpListen { port, ns }, fd)
    }

    /// Check that the reference is inside the encodable domain.
    pub fn validate(&self) -> Result<(), RefError> {
        if !(0..=FD_REF_MAX).contains(&self.fd) {
            return Err(RefError::FdOutOfRange(self.fd));
        }
        if let RefKind::Tcp { index, .. } = self.kind {
            if index >= TCP_MAX_CONNS {
                return Err(RefError::IndexOutOfRange(index));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<u64, RefError> {
        self.validate()?;

        let (kind, payload) = match self.kind {
            RefKind::Tap => (KIND_TAP, 0u32),
            RefKind::Timer => (KIND_TIMER, 0),
            RefKind::Signal => (KIND_SIGNAL, 0),
            RefKind::Tcp { index, side } => {
                let side = match side {
                    Side::Primary => 0,
                    Side::Secondary => SIDE_BIT,
                };
                (KIND_TCP, index | side)
            }
            RefKind::TcpListen { port, ns } => {
                (KIND_TCP_LISTEN, port as u32 | if ns { NS_BIT } else { 0 })
            }
        };

        Ok(kind | ((self.fd as u64) << FD_SHIFT) | ((payload as u64) << PAYLOAD_SHIFT))
    }

    pub fn decode(raw: u64) -> Result<Self, RefError> {
        if raw & RESERVED_MASK != 0 {
            return Err(RefError::ReservedBits(raw));
        }

        let fd = ((raw >> FD_SHIFT) & FD_MASK) as RawFd;
        let payload = (raw >> PAYLOAD_SHIFT) as u32;

        let kind = match raw & KIND_MASK {
            KIND_TAP | KIND_TIMER | KIND_SIGNAL if payload != 0 => {
                return Err(RefError::ReservedBits(raw));
            }
            KIND_TAP => RefKind::Tap,
            KIND_TIMER => RefKind::Timer,
            KIND_SIGNAL => RefKind::Signal,
            KIND_TCP => {
                if payload & !(INDEX_MASK | SIDE_BIT) != 0 {
                    return Err(RefError::ReservedBits(raw));
                }
                let index = payload & INDEX_MASK;
                if index >= TCP_MAX_CONNS {
                    return Err(RefError::IndexOutOfRange(index));
                }
                let side = if payload & SIDE_BIT != 0 {
                    Side::Secondary
                } else {
                    Side::Primary
                };
                RefKind::Tcp { index, side }
            }
            KIND_TCP_LISTEN => {
                if payload & !(0xffff | NS_BIT) != 0 {
                    return Err(RefError::ReservedBits(raw));
                }
                RefKind::TcpListen {
                    port: payload as u16,
                    ns: payload & NS_BIT != 0,
                }
            }
            other => return Err(RefError::UnknownKind(other as u8)),
        };

        Ok(Self { kind, fd })
    }
}
