//! Connection records.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use bitflags::bitflags;

use crate::epoll_ref::Side;
use crate::hash::FlowKey;
use crate::host::{Interest, Pipe};
use crate::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Closed,
    /// Guest SYN accepted, host connect not issued yet.
    TapSynRcvd,
    /// Waiting for the host-side connect to complete.
    HostConnecting,
    /// Host connection accepted, SYN sent to the guest.
    TapSynSent,
    Established,
    /// At least one direction has seen a FIN.
    Closing,
    TimeWait,
    Aborted,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Guest,
    Host,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnFlags: u16 {
        /// The guest acknowledged our SYN or SYN|ACK.
        const SYN_ACKED = 1 << 0;
        /// The guest sent a FIN and we acknowledged it.
        const TAP_FIN_RCVD = 1 << 1;
        /// We sent a FIN to the guest.
        const TAP_FIN_SENT = 1 << 2;
        const TAP_FIN_ACKED = 1 << 3;
        /// The host socket reached end of stream.
        const SOCK_EOF = 1 << 4;
        /// We shut down the host socket for writing.
        const SOCK_SHUT_WR = 1 << 5;
        /// Read interest dropped because the unacknowledged buffer is full.
        const READ_BLOCKED = 1 << 6;
        /// Queued for the deferred handler.
        const DEFERRED = 1 << 7;
        /// The guest offered window scaling, so both directions use it.
        const WS_OK = 1 << 8;
    }
}

/// A flow between the guest and a host socket, translated segment by segment.
#[derive(Debug)]
pub struct TapConn {
    pub key: FlowKey,
    pub sock: RawFd,
    /// Endpoint of the host socket's peer.
    pub sock_peer: SocketAddr,
    pub origin: Origin,
    pub phase: Phase,
    pub flags: ConnFlags,
    pub flow_label: u32,

    /// Our initial sequence number towards the guest.
    pub isn_to_tap: u32,
    /// Next sequence number we send to the guest.
    pub seq_to_tap: u32,
    /// Highest sequence number sent so far. Unlike `seq_to_tap`, a retransmission does not
    /// move it back.
    pub seq_max_to_tap: u32,
    /// Oldest sequence number the guest has not acknowledged.
    pub seq_ack_from_tap: u32,
    /// Guest's receive window in bytes, already scaled.
    pub wnd_from_tap: u32,
    pub ws_from_tap: u8,
    /// Segment size towards the guest.
    pub mss_to_tap: u16,

    pub isn_from_tap: u32,
    /// Next sequence number expected from the guest.
    pub seq_from_tap: u32,
    /// Last acknowledgment number sent to the guest.
    pub seq_ack_to_tap: u32,
    pub ws_to_tap: u8,
    /// Last window advertised to the guest, in bytes.
    pub wnd_to_tap: u32,

    /// Bytes read from the socket starting at `seq_ack_from_tap`; the first `sent` of them are in
    /// flight.
    pub unacked: VecDeque<u8>,
    pub sent: usize,
    /// Guest bytes acknowledged by us but not yet taken by the socket.
    pub to_sock: VecDeque<u8>,
    /// Out-of-order guest segments, by sequence number.
    pub ooo: Vec<(u32, Vec<u8>)>,
    pub ooo_bytes: usize,

    pub interest: Interest,
    pub retries: u8,
    /// Start of the current retransmission interval.
    pub rto_since: Millis,
    /// Entry into the current handshake or quiescence phase.
    pub since: Millis,
    pub last_activity: Millis,
    pub deadline: Option<Millis>,
}

impl TapConn {
    pub fn new(key: FlowKey, sock: RawFd, sock_peer: SocketAddr, origin: Origin, now: Millis) -> Self {
        Self {
            key,
            sock,
            sock_peer,
            origin,
            phase: Phase::Closed,
            flags: ConnFlags::empty(),
            flow_label: 0,
            isn_to_tap: 0,
            seq_to_tap: 0,
            seq_max_to_tap: 0,
            seq_ack_from_tap: 0,
            wnd_from_tap: 0,
            ws_from_tap: 0,
            mss_to_tap: 536,
            isn_from_tap: 0,
            seq_from_tap: 0,
            seq_ack_to_tap: 0,
            ws_to_tap: 0,
            wnd_to_tap: 0,
            unacked: VecDeque::new(),
            sent: 0,
            to_sock: VecDeque::new(),
            ooo: Vec::new(),
            ooo_bytes: 0,
            interest: Interest::empty(),
            retries: 0,
            rto_since: now,
            since: now,
            last_activity: now,
            deadline: None,
        }
    }

    pub fn is_v6(&self) -> bool {
        self.key.guest.is_ipv6()
    }

    /// Sequence space sent to the guest and not yet acknowledged, including SYN and FIN.
    pub fn in_flight(&self) -> u32 {
        self.seq_to_tap.wrapping_sub(self.seq_ack_from_tap)
    }

    /// Sequence space ever sent and not yet acknowledged. An ACK beyond it is bogus.
    pub fn sent_space(&self) -> u32 {
        self.seq_max_to_tap.wrapping_sub(self.seq_ack_from_tap)
    }

    /// Move the send position to `seq` after sending up to it.
    pub fn advance_seq_to_tap(&mut self, seq: u32) {
        self.seq_to_tap = seq;
        if seq.wrapping_sub(self.seq_max_to_tap) as i32 > 0 {
            self.seq_max_to_tap = seq;
        }
    }

    pub fn unsent(&self) -> usize {
        self.unacked.len() - self.sent
    }

    pub fn has(&self, flags: ConnFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Both directions closed and our FIN acknowledged.
    pub fn fully_closed(&self) -> bool {
        self.has(
            ConnFlags::TAP_FIN_RCVD
                | ConnFlags::SOCK_SHUT_WR
                | ConnFlags::SOCK_EOF
                | ConnFlags::TAP_FIN_SENT
                | ConnFlags::TAP_FIN_ACKED,
        )
    }
}

bitflags! {
    /// Per-side state of a spliced connection, indexed by [`Side`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpliceFlags: u8 {
        /// Reading from the socket returned end of stream.
        const EOF = 1 << 0;
        /// Writing towards this socket has been shut down.
        const SHUT_WR = 1 << 1;
    }
}

/// Bytes of one direction of a spliced connection that were read but not yet written.
#[derive(Debug, Default)]
pub struct SpliceDir {
    /// Bytes sitting in the pipe for this direction.
    pub pending: usize,
    /// Userspace copy buffer, used when the connection has no pipes.
    pub bounce: VecDeque<u8>,
}

/// A flow between two host sockets, both owned by this process.
///
/// Direction `d` carries data read from `socks[d]` and written to `socks[d.other()]`.
#[derive(Debug)]
pub struct SpliceConn {
    pub socks: [RawFd; 2],
    pub phase: Phase,
    /// Accepted in the guest namespace.
    pub ns: bool,
    pub pipes: Option<[Pipe; 2]>,
    pub dirs: [SpliceDir; 2],
    pub flags: [SpliceFlags; 2],
    pub interest: [Interest; 2],
    pub since: Millis,
    pub last_activity: Millis,
    pub deadline: Option<Millis>,
}

impl SpliceConn {
    pub fn new(accepted: RawFd, connected: RawFd, ns: bool, now: Millis) -> Self {
        Self {
            socks: [accepted, connected],
            phase: Phase::HostConnecting,
            ns,
            pipes: None,
            dirs: Default::default(),
            flags: [SpliceFlags::empty(); 2],
            interest: [Interest::empty(); 2],
            since: now,
            last_activity: now,
            deadline: None,
        }
    }

    pub fn sock(&self, side: Side) -> RawFd {
        self.socks[side.slot()]
    }

    pub fn has(&self, side: Side, flags: SpliceFlags) -> bool {
        self.flags[side.slot()].contains(flags)
    }

    pub fn both_closed(&self) -> bool {
        self.has(Side::Primary, SpliceFlags::SHUT_WR) && self.has(Side::Secondary, SpliceFlags::SHUT_WR)
    }
}

#[derive(Debug)]
pub enum Flow {
    Tap(TapConn),
    Splice(SpliceConn),
}

impl Flow {
    /// Tuple the flow is indexed under. Spliced flows are reached through their event
    /// references only.
    pub fn key(&self) -> Option<&FlowKey> {
        match self {
            Flow::Tap(conn) => Some(&conn.key),
            Flow::Splice(_) => None,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Flow::Tap(conn) => conn.phase,
            Flow::Splice(conn) => conn.phase,
        }
    }

    pub fn deadline(&self) -> Option<Millis> {
        match self {
            Flow::Tap(conn) => conn.deadline,
            Flow::Splice(conn) => conn.deadline,
        }
    }

    /// Socket a reference with this side should point at.
    pub fn sock(&self, side: Side) -> Option<RawFd> {
        match (self, side) {
            (Flow::Tap(conn), Side::Primary) => Some(conn.sock),
            (Flow::Tap(_), Side::Secondary) => None,
            (Flow::Splice(conn), side) => Some(conn.sock(side)),
        }
    }

    pub fn as_tap(&self) -> Option<&TapConn> {
        match self {
            Flow::Tap(conn) => Some(conn),
            Flow::Splice(_) => None,
        }
    }

    pub fn as_splice(&self) -> Option<&SpliceConn> {
        match self {
            Flow::Splice(conn) => Some(conn),
            Flow::Tap(_) => None,
        }
    }
}

/// What the caller must do with a record after handling an event for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub(crate) enum Verdict {
    Keep,
    Release,
}
