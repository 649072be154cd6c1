use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::RangeInclusive;

use crate::fwd::{FwdDirection, PortFwd};
use crate::{Millis, TCP_MAX_CONNS};

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Guest address for IPv4 flows. Inbound IPv4 connections are rejected when unset.
    pub guest_addr4: Option<Ipv4Addr>,
    /// Guest address for IPv6 flows.
    pub guest_addr6: Option<Ipv6Addr>,
    /// Address the guest uses to reach the host itself. Guest connections to it are redirected
    /// to the host's loopback, and loopback peers of inbound connections are presented to the
    /// guest under this address.
    pub gateway_addr4: Option<Ipv4Addr>,
    pub gateway_addr6: Option<Ipv6Addr>,

    /// Tap MTU; bounds the MSS we advertise to the guest.
    pub mtu: u16,

    /// Inbound rule set: host ports exposed to the guest.
    pub fwd_in: PortFwd,
    /// Outbound rule set: which guest destination ports may be forwarded, and where.
    pub fwd_out: PortFwd,

    /// Local port range the host hands out to outgoing connections. An `all` rule does not
    /// bind listeners in it.
    pub ephemeral_ports: RangeInclusive<u16>,

    /// Enable the spliced path for loopback traffic crossing the namespace boundary. Requires a
    /// guest network namespace.
    pub splice: bool,

    /// Maximum number of live connection records. Clamped to [`TCP_MAX_CONNS`].
    ///
    /// When exceeded, new guest SYNs are answered with a reset and new host connections are
    /// closed; no state is allocated.
    pub max_connections: u32,

    /// Bytes read from a host socket and not yet acknowledged by the guest, per connection.
    /// Reading stops while the buffer is full.
    pub max_unacked_to_tap: u32,

    /// Bytes accepted from the guest that the host socket has not taken yet, per connection.
    /// Data beyond this is not acknowledged, so the guest retransmits it.
    pub max_pending_to_sock: u32,

    /// Out-of-order guest bytes held for reassembly, per connection.
    pub reorder_allowance: u32,

    /// Userspace bounce buffer per direction for spliced connections without pipes.
    pub splice_fallback_buf: u32,

    pub timer_interval_ms: Millis,
    /// Initial retransmission timeout; doubles on every retry.
    pub rto_initial_ms: Millis,
    pub rto_max_ms: Millis,
    /// Retransmissions before a flow is aborted.
    pub max_retries: u8,
    /// Time allowed for a host connect or a guest handshake to complete.
    pub handshake_timeout_ms: Millis,
    /// Flows without any traffic for this long are aborted.
    pub idle_timeout_ms: Millis,
    /// Quiescence period after both directions closed.
    pub time_wait_ms: Millis,
    /// Closing flows stuck waiting for the other direction are aborted after this long.
    pub fin_timeout_ms: Millis,

    /// Connection count under which sockets get large kernel buffers.
    pub low_buf_threshold: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            guest_addr4: Some(Ipv4Addr::new(10, 0, 2, 15)),
            guest_addr6: None,
            gateway_addr4: Some(Ipv4Addr::new(10, 0, 2, 2)),
            gateway_addr6: None,
            mtu: 65520,
            fwd_in: PortFwd::none(FwdDirection::Inbound),
            fwd_out: PortFwd::all(FwdDirection::Outbound),
            ephemeral_ports: 32768..=60999,
            splice: false,
            max_connections: 8192,
            max_unacked_to_tap: 256 * 1024,
            max_pending_to_sock: 256 * 1024,
            reorder_allowance: 64 * 1024,
            splice_fallback_buf: 64 * 1024,
            timer_interval_ms: 1000,
            rto_initial_ms: 1000,
            rto_max_ms: 60_000,
            max_retries: 5,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 2 * 60 * 60 * 1000,
            time_wait_ms: 10_000,
            fin_timeout_ms: 60_000,
            low_buf_threshold: 100,
        }
    }
}

impl TcpConfig {
    pub fn capacity(&self) -> u32 {
        self.max_connections.min(TCP_MAX_CONNS)
    }

    pub fn guest_addr(&self, v6: bool) -> Option<IpAddr> {
        if v6 {
            self.guest_addr6.map(IpAddr::V6)
        } else {
            self.guest_addr4.map(IpAddr::V4)
        }
    }

    pub fn gateway_addr(&self, v6: bool) -> Option<IpAddr> {
        if v6 {
            self.gateway_addr6.map(IpAddr::V6)
        } else {
            self.gateway_addr4.map(IpAddr::V4)
        }
    }

    /// MSS we advertise to the guest for a given family.
    pub fn mss(&self, v6: bool) -> u16 {
        let headers = if v6 { 60 } else { 40 };
        self.mtu.saturating_sub(headers).max(536)
    }
}
