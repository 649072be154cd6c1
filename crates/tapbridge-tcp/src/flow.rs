//! Tap-side flow state machine.
//!
//! Every function here operates on one record that the engine has already looked up; none of
//! them touch the connection table. Records that must go away are reported back with
//! [`Verdict::Release`], after all their resources have been closed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

use tracing::{debug, trace};

use crate::config::TcpConfig;
use crate::conn::{ConnFlags, Origin, Phase, TapConn, Verdict};
use crate::ctx::TcpCtx;
use crate::epoll_ref::{EpollRef, Side};
use crate::error::{Result, TcpError};
use crate::hash::FlowKey;
use crate::host::{would_block, Events, HostIo, Interest};
use crate::packet::{TcpFlags, TcpOptions, TcpSegment, TcpSegmentBuilder, IPPROTO_TCP};
use crate::stats::TcpStats;
use crate::tap::{TapFrame, TapIo};
use crate::timer::{rto, Timers};
use crate::Millis;

/// Window scale we offer the guest.
pub const WS_TO_TAP: u8 = 8;

/// MSS assumed when the guest does not send the option (RFC 9293).
const DEFAULT_MSS: u16 = 536;

/// Disjoint borrows of the engine state a flow handler needs.
pub(crate) struct FlowCtx<'a, H, T> {
    pub cfg: &'a TcpConfig,
    pub ctx: &'a mut TcpCtx,
    pub host: &'a mut H,
    pub tap: &'a mut T,
    pub timers: &'a mut Timers,
    pub stats: &'a mut TcpStats,
    /// Records to revisit from the deferred handler.
    pub deferred: &'a mut Vec<u32>,
    pub scratch: &'a mut [u8],
    pub now: Millis,
}

fn loopback(v6: bool) -> IpAddr {
    if v6 {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

/// Host endpoint a guest connection to `key.remote` is forwarded to.
pub(crate) fn map_outbound(cfg: &TcpConfig, ctx: &TcpCtx, key: &FlowKey) -> Result<SocketAddr> {
    let target = ctx
        .fwd_out
        .lookup(key.remote.port())
        .ok_or(TcpError::RuleDenied)?;
    let v6 = key.remote.is_ipv6();
    let ip = match target.addr {
        Some(addr) => addr,
        None if cfg.gateway_addr(v6) == Some(key.remote.ip()) => loopback(v6),
        None => key.remote.ip(),
    };
    Ok(SocketAddr::new(ip, target.port))
}

/// Address the guest sees for a host peer: loopback peers appear as the gateway.
pub(crate) fn map_inbound_peer(cfg: &TcpConfig, peer: SocketAddr) -> SocketAddr {
    let ip = peer.ip();
    match cfg.gateway_addr(peer.is_ipv6()) {
        Some(gw) if ip.is_loopback() => SocketAddr::new(gw, peer.port()),
        _ => peer,
    }
}

fn token(index: u32, fd: RawFd) -> Result<u64> {
    Ok(EpollRef::tcp(index, Side::Primary, fd).encode()?)
}

fn send_raw<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    src: SocketAddr,
    dst: SocketAddr,
    flow: u32,
    segment: TcpSegmentBuilder<'_>,
) {
    match segment.build(src.ip(), dst.ip()) {
        Ok(bytes) => fcx.tap.send_frame(TapFrame {
            src: src.ip(),
            dst: dst.ip(),
            protocol: IPPROTO_TCP,
            payload: &bytes,
            flow,
        }),
        Err(err) => debug!(reason = err.reason(), "failed to build segment"),
    }
}

/// Reset a segment that has no record, or whose flow was refused.
pub(crate) fn reset_unknown<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    key: &FlowKey,
    seg: &TcpSegment<'_>,
) {
    if seg.flags().contains(TcpFlags::RST) {
        return;
    }
    let segment = if seg.flags().contains(TcpFlags::ACK) {
        TcpSegmentBuilder::new(
            key.remote.port(),
            key.guest.port(),
            seg.ack_number(),
            0,
            TcpFlags::RST,
        )
    } else {
        TcpSegmentBuilder::new(
            key.remote.port(),
            key.guest.port(),
            0,
            seg.seq_number().wrapping_add(seg.seq_len()),
            TcpFlags::RST | TcpFlags::ACK,
        )
    };
    fcx.stats.resets_to_tap += 1;
    send_raw(fcx, key.remote, key.guest, 0, segment);
}

/// Window we can offer the guest right now, in bytes.
fn window_to_tap<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, conn: &TapConn) -> u32 {
    let pending = conn.to_sock.len() as u32;
    let limit = match fcx.host.window(conn.sock) {
        Ok(w) => {
            let mut limit = w.sndbuf_free();
            // A zero window with nothing queued is a stale value left over from before the
            // connection was established; fall back to buffer space.
            if fcx.ctx.kernel_snd_wnd {
                if let Some(snd_wnd) = w.snd_wnd {
                    if snd_wnd > 0 || w.unsent > 0 {
                        limit = limit.min(snd_wnd);
                    }
                }
            }
            limit
        }
        Err(_) => fcx.cfg.max_pending_to_sock,
    };
    limit
        .saturating_sub(pending)
        .min((u16::MAX as u32) << conn.ws_to_tap)
}

/// Emit a segment on `conn`, acknowledging everything received so far.
fn emit<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    conn: &mut TapConn,
    flags: TcpFlags,
    seq: u32,
    payload: &[u8],
) {
    let syn = flags.contains(TcpFlags::SYN);
    let options = if syn {
        TcpOptions {
            mss: Some(fcx.cfg.mss(conn.is_v6())),
            wscale: (conn.origin == Origin::Host || conn.has(ConnFlags::WS_OK)).then_some(WS_TO_TAP),
        }
        .encode()
    } else {
        Vec::new()
    };

    let (ack, window) = if flags.contains(TcpFlags::RST) {
        (conn.seq_from_tap, 0)
    } else {
        let wnd = if conn.sock >= 0 {
            window_to_tap(fcx, conn)
        } else {
            0
        };
        // Windows on SYN segments are never scaled.
        let field = if syn {
            wnd.min(u16::MAX as u32)
        } else {
            (wnd >> conn.ws_to_tap).min(u16::MAX as u32)
        };
        conn.wnd_to_tap = if syn { field } else { field << conn.ws_to_tap };
        (conn.seq_from_tap, field as u16)
    };
    let ack = if flags.contains(TcpFlags::ACK) { ack } else { 0 };
    conn.seq_ack_to_tap = ack;

    trace!(
        guest = %conn.key.guest,
        remote = %conn.key.remote,
        flags = flags.0,
        seq,
        ack,
        len = payload.len(),
        "segment to tap"
    );
    let segment = TcpSegmentBuilder::new(conn.key.remote.port(), conn.key.guest.port(), seq, ack, flags)
        .window(window)
        .options(&options)
        .payload(payload);
    send_raw(fcx, conn.key.remote, conn.key.guest, conn.flow_label, segment);
}

fn send_ack<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, conn: &mut TapConn) {
    let seq = conn.seq_to_tap;
    emit(fcx, conn, TcpFlags::ACK, seq, &[]);
}

fn set_interest<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    interest: Interest,
) -> Result<()> {
    if conn.interest == interest || conn.sock < 0 {
        return Ok(());
    }
    fcx.host
        .rewatch(conn.sock, token(index, conn.sock)?, interest)
        .map_err(TcpError::ResourceAllocationFailure)?;
    conn.interest = interest;
    Ok(())
}

/// Interest matching the current buffers: read while there is room for host data, write while
/// guest data waits for the socket.
fn refresh_interest<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
) -> Result<()> {
    let mut interest = Interest::empty();
    if conn.has(ConnFlags::SYN_ACKED) && !conn.has(ConnFlags::SOCK_EOF) {
        if conn.unacked.len() < fcx.cfg.max_unacked_to_tap as usize {
            conn.flags.remove(ConnFlags::READ_BLOCKED);
            interest |= Interest::READ;
        } else {
            conn.flags.insert(ConnFlags::READ_BLOCKED);
        }
    }
    if !conn.to_sock.is_empty() {
        interest |= Interest::WRITE;
    }
    set_interest(fcx, index, conn, interest)
}

fn next_deadline(cfg: &TcpConfig, conn: &TapConn) -> Option<Millis> {
    let at = match conn.phase {
        Phase::Closed | Phase::Aborted => return None,
        Phase::TimeWait => conn.since + cfg.time_wait_ms,
        Phase::TapSynRcvd | Phase::HostConnecting => conn.since + cfg.handshake_timeout_ms,
        _ if conn.in_flight() > 0 || (conn.unsent() > 0 && conn.wnd_from_tap == 0) => {
            conn.rto_since + rto(cfg, conn.retries)
        }
        Phase::Closing => conn.last_activity + cfg.fin_timeout_ms,
        _ => conn.last_activity + cfg.idle_timeout_ms,
    };
    Some(at)
}

fn rearm<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, index: u32, conn: &mut TapConn) {
    let next = next_deadline(fcx.cfg, conn);
    conn.deadline = fcx.timers.rearm(index, conn.deadline, next);
}

/// Tear the flow down after `err`. The guest gets a reset unless it sent one itself; the host
/// socket, if still open, is closed abortively.
pub(crate) fn abort<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    err: TcpError,
) -> Verdict {
    debug!(index, guest = %conn.key.guest, remote = %conn.key.remote, phase = ?conn.phase, error = %err, "aborting flow");
    if err.wants_reset() && conn.phase != Phase::TimeWait {
        let seq = conn.seq_to_tap;
        emit(fcx, conn, TcpFlags::RST | TcpFlags::ACK, seq, &[]);
        fcx.stats.resets_to_tap += 1;
    }
    if conn.sock >= 0 {
        fcx.host.reset(conn.sock);
        conn.sock = -1;
    }
    conn.phase = Phase::Aborted;
    fcx.stats.flows_aborted += 1;
    Verdict::Release
}

fn guard<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    res: Result<()>,
) -> Verdict {
    match res {
        Ok(()) => {
            rearm(fcx, index, conn);
            Verdict::Keep
        }
        Err(err) => abort(fcx, index, conn, err),
    }
}

/// Record for a guest SYN, before a host socket exists.
pub(crate) fn from_tap_syn<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    key: FlowKey,
    seg: &TcpSegment<'_>,
    dst: SocketAddr,
) -> TapConn {
    let mut conn = TapConn::new(key, -1, dst, Origin::Guest, fcx.now);
    conn.phase = Phase::TapSynRcvd;
    conn.flow_label = fcx.ctx.hash_secret.flow_label(&key);

    conn.isn_from_tap = seg.seq_number();
    conn.seq_from_tap = seg.seq_number().wrapping_add(1);
    conn.wnd_from_tap = seg.window_size() as u32;
    let opts = seg.parsed_options();
    conn.mss_to_tap = opts
        .mss
        .unwrap_or(DEFAULT_MSS)
        .min(fcx.cfg.mss(key.guest.is_ipv6()));
    if let Some(ws) = opts.wscale {
        conn.flags.insert(ConnFlags::WS_OK);
        conn.ws_from_tap = ws;
        conn.ws_to_tap = WS_TO_TAP;
    }

    let isn = fcx.ctx.hash_secret.isn(&key, fcx.now);
    conn.isn_to_tap = isn;
    conn.seq_to_tap = isn;
    conn.seq_max_to_tap = isn;
    conn.seq_ack_from_tap = isn;
    conn
}

/// Open the host side of a guest-initiated flow.
pub(crate) fn connect<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
) -> Verdict {
    let (fd, done) = match fcx.host.connect(conn.sock_peer, false) {
        Ok(res) => res,
        Err(err) => {
            fcx.stats.rejected += 1;
            return abort(fcx, index, conn, TcpError::HostConnectFailure(err));
        }
    };
    conn.sock = fd;
    conn.phase = Phase::HostConnecting;
    fcx.host.set_bufsize(fd, fcx.ctx.large_bufs);
    debug!(index, guest = %conn.key.guest, target = %conn.sock_peer, "connecting");

    let watched = token(index, fd).and_then(|tok| {
        fcx.host
            .watch(fd, tok, Interest::WRITE)
            .map_err(TcpError::ResourceAllocationFailure)
    });
    if let Err(err) = watched {
        return abort(fcx, index, conn, err);
    }
    conn.interest = Interest::WRITE;

    if done {
        return connect_done(fcx, index, conn);
    }
    rearm(fcx, index, conn);
    Verdict::Keep
}

fn connect_done<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
) -> Verdict {
    match fcx.host.take_error(conn.sock) {
        Ok(None) => {}
        Ok(Some(err)) | Err(err) => {
            return abort(fcx, index, conn, TcpError::HostConnectFailure(err));
        }
    }

    conn.phase = Phase::Established;
    conn.since = fcx.now;
    conn.rto_since = fcx.now;
    let isn = conn.isn_to_tap;
    emit(fcx, conn, TcpFlags::SYN | TcpFlags::ACK, isn, &[]);
    conn.advance_seq_to_tap(isn.wrapping_add(1));
    debug!(index, guest = %conn.key.guest, target = %conn.sock_peer, "host connected");

    // No host data until the guest acknowledges our SYN|ACK.
    let res = set_interest(fcx, index, conn, Interest::empty());
    guard(fcx, index, conn, res)
}

/// Record for a connection accepted by a host listener, towards guest port `port`.
pub(crate) fn from_host_accept<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    fd: RawFd,
    peer: SocketAddr,
    port: u16,
) -> Option<TapConn> {
    let guest = fcx.cfg.guest_addr(peer.is_ipv6())?;
    let key = FlowKey::new(SocketAddr::new(guest, port), map_inbound_peer(fcx.cfg, peer));

    let mut conn = TapConn::new(key, fd, peer, Origin::Host, fcx.now);
    conn.phase = Phase::TapSynSent;
    conn.flow_label = fcx.ctx.hash_secret.flow_label(&key);
    conn.ws_to_tap = WS_TO_TAP;
    let isn = fcx.ctx.hash_secret.isn(&key, fcx.now);
    conn.isn_to_tap = isn;
    conn.seq_to_tap = isn;
    conn.seq_max_to_tap = isn;
    conn.seq_ack_from_tap = isn;
    Some(conn)
}

/// Start the guest-side handshake for an accepted connection.
pub(crate) fn open_to_tap<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
) -> Verdict {
    fcx.host.set_bufsize(conn.sock, fcx.ctx.large_bufs);
    let watched = token(index, conn.sock).and_then(|tok| {
        fcx.host
            .watch(conn.sock, tok, Interest::empty())
            .map_err(TcpError::ResourceAllocationFailure)
    });
    if let Err(err) = watched {
        return abort(fcx, index, conn, err);
    }

    let isn = conn.isn_to_tap;
    emit(fcx, conn, TcpFlags::SYN, isn, &[]);
    conn.advance_seq_to_tap(isn.wrapping_add(1));
    conn.rto_since = fcx.now;
    debug!(index, guest = %conn.key.guest, peer = %conn.sock_peer, "SYN to guest");
    rearm(fcx, index, conn);
    Verdict::Keep
}

/// A segment from the guest for an existing record.
pub(crate) fn tap_segment<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    seg: &TcpSegment<'_>,
) -> Verdict {
    let flags = seg.flags();
    conn.last_activity = fcx.now;

    if flags.contains(TcpFlags::RST) {
        if !rst_acceptable(fcx, index, conn, seg) {
            return Verdict::Keep;
        }
        if conn.phase == Phase::TimeWait {
            debug!(index, "reset in time wait");
            fcx.stats.flows_closed += 1;
            return Verdict::Release;
        }
        return abort(fcx, index, conn, TcpError::TapReset);
    }

    match conn.phase {
        Phase::TapSynRcvd | Phase::HostConnecting => {
            // Retransmitted SYN while the host connect is in progress: the SYN|ACK follows once
            // it completes.
            rearm(fcx, index, conn);
            Verdict::Keep
        }
        Phase::TapSynSent => tap_handshake_reply(fcx, index, conn, seg),
        Phase::Established | Phase::Closing => {
            let res = tap_established(fcx, index, conn, seg);
            if res.is_ok() {
                check_closed(fcx, conn);
            }
            guard(fcx, index, conn, res)
        }
        Phase::TimeWait => {
            if flags.contains(TcpFlags::FIN) || !seg.payload().is_empty() {
                send_ack(fcx, conn);
            }
            Verdict::Keep
        }
        Phase::Closed | Phase::Aborted => Verdict::Keep,
    }
}

/// Whether a guest reset may end the flow (RFC 5961, section 3.2). While our SYN is
/// outstanding it must acknowledge it; afterwards its sequence number must be exactly the next
/// one expected. Resets elsewhere in the receive window get a challenge ACK, the rest are dropped.
fn rst_acceptable<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    seg: &TcpSegment<'_>,
) -> bool {
    if conn.phase == Phase::TapSynSent {
        return seg.flags().contains(TcpFlags::ACK) && seg.ack_number() == conn.seq_to_tap;
    }
    let offset = seg.seq_number().wrapping_sub(conn.seq_from_tap);
    if offset == 0 {
        return true;
    }
    if offset < conn.wnd_to_tap.max(1) && conn.has(ConnFlags::SYN_ACKED) {
        trace!(index, seq = seg.seq_number(), "reset inside the window, sending challenge ACK");
        send_ack(fcx, conn);
    } else {
        trace!(index, seq = seg.seq_number(), "reset outside the window");
    }
    false
}

fn tap_handshake_reply<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    seg: &TcpSegment<'_>,
) -> Verdict {
    let flags = seg.flags();
    if !flags.contains(TcpFlags::SYN | TcpFlags::ACK) || seg.ack_number() != conn.seq_to_tap {
        trace!(index, flags = flags.0, "unexpected segment while waiting for SYN|ACK");
        return Verdict::Keep;
    }

    conn.isn_from_tap = seg.seq_number();
    conn.seq_from_tap = seg.seq_number().wrapping_add(1);
    let opts = seg.parsed_options();
    conn.mss_to_tap = opts
        .mss
        .unwrap_or(DEFAULT_MSS)
        .min(fcx.cfg.mss(conn.is_v6()));
    match opts.wscale {
        Some(ws) => {
            conn.flags.insert(ConnFlags::WS_OK);
            conn.ws_from_tap = ws;
        }
        None => conn.ws_to_tap = 0,
    }
    // The window on a SYN|ACK is unscaled.
    conn.wnd_from_tap = seg.window_size() as u32;
    conn.seq_ack_from_tap = seg.ack_number();
    conn.flags.insert(ConnFlags::SYN_ACKED);
    conn.retries = 0;
    conn.phase = Phase::Established;
    conn.since = fcx.now;
    debug!(index, guest = %conn.key.guest, peer = %conn.sock_peer, "established");

    send_ack(fcx, conn);
    let res = refresh_interest(fcx, index, conn);
    guard(fcx, index, conn, res)
}

fn tap_established<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    seg: &TcpSegment<'_>,
) -> Result<()> {
    let flags = seg.flags();

    if flags.contains(TcpFlags::SYN) {
        if !flags.contains(TcpFlags::ACK) {
            // Our SYN|ACK got lost: the guest repeats its SYN.
            if !conn.has(ConnFlags::SYN_ACKED) && seg.seq_number() == conn.isn_from_tap {
                trace!(index, "SYN retransmitted, repeating SYN|ACK");
                let isn = conn.isn_to_tap;
                emit(fcx, conn, TcpFlags::SYN | TcpFlags::ACK, isn, &[]);
            }
        } else if conn.origin == Origin::Host {
            // Our ACK of the guest's SYN|ACK got lost.
            send_ack(fcx, conn);
        }
        return Ok(());
    }

    if flags.contains(TcpFlags::ACK) {
        tap_ack(fcx, index, conn, seg.ack_number(), seg.window_size());
    }
    if !conn.has(ConnFlags::SYN_ACKED) {
        return Ok(());
    }

    let mut need_ack = false;
    let payload = seg.payload();
    if !payload.is_empty() {
        need_ack = true;
        tap_data(fcx, conn, seg.seq_number(), payload)?;
    }

    if flags.contains(TcpFlags::FIN) {
        need_ack = true;
        let fin_seq = seg.seq_number().wrapping_add(payload.len() as u32);
        if fin_seq == conn.seq_from_tap && !conn.has(ConnFlags::TAP_FIN_RCVD) {
            conn.seq_from_tap = conn.seq_from_tap.wrapping_add(1);
            conn.flags.insert(ConnFlags::TAP_FIN_RCVD);
            conn.phase = Phase::Closing;
            debug!(index, guest = %conn.key.guest, "FIN from guest");
            shutdown_if_flushed(fcx, conn)?;
        }
    }

    if need_ack {
        send_ack(fcx, conn);
    }
    send_pending(fcx, conn, false);
    send_fin_if_done(fcx, index, conn);
    refresh_interest(fcx, index, conn)
}

fn tap_ack<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    ack: u32,
    window: u16,
) {
    let acked = ack.wrapping_sub(conn.seq_ack_from_tap);
    if acked > conn.sent_space() {
        trace!(index, ack, "ACK for data never sent");
        return;
    }
    // SYN|ACK segments carry unscaled windows; everything after is scaled.
    if conn.has(ConnFlags::SYN_ACKED) || acked > 0 {
        conn.wnd_from_tap = (window as u32) << conn.ws_from_tap;
    }
    if acked == 0 {
        return;
    }

    // The first acknowledged unit of a fresh flow is our SYN, not data.
    let mut data_acked = acked as usize;
    if !conn.has(ConnFlags::SYN_ACKED) {
        conn.flags.insert(ConnFlags::SYN_ACKED);
        data_acked -= 1;
        debug!(index, guest = %conn.key.guest, "established");
    }
    let buffered = conn.unacked.len();
    let data = data_acked.min(buffered);
    conn.unacked.drain(..data);
    conn.sent = conn.sent.saturating_sub(data);
    conn.seq_ack_from_tap = ack;
    if ack.wrapping_sub(conn.seq_to_tap) as i32 > 0 {
        // Covers segments sent before a retransmission rewound `seq_to_tap`.
        conn.seq_to_tap = ack;
        if conn.has(ConnFlags::SOCK_EOF) && data_acked > buffered {
            conn.flags.insert(ConnFlags::TAP_FIN_SENT);
        }
    }
    if conn.has(ConnFlags::TAP_FIN_SENT) && ack == conn.seq_to_tap {
        conn.flags.insert(ConnFlags::TAP_FIN_ACKED);
    }
    conn.retries = 0;
    conn.rto_since = fcx.now;

    if conn.has(ConnFlags::READ_BLOCKED) && !conn.has(ConnFlags::DEFERRED) {
        conn.flags.insert(ConnFlags::DEFERRED);
        fcx.deferred.push(index);
    }
}

/// Accept in-order guest payload starting at `seq`, queueing what arrives early.
fn tap_data<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    conn: &mut TapConn,
    seq: u32,
    payload: &[u8],
) -> Result<()> {
    let offset = seq.wrapping_sub(conn.seq_from_tap) as i32;
    if offset > 0 {
        let offset = offset as usize;
        let allowance = fcx.cfg.reorder_allowance as usize;
        if offset + payload.len() <= allowance
            && conn.ooo_bytes + payload.len() <= allowance
            && !conn.ooo.iter().any(|(s, _)| *s == seq)
        {
            trace!(seq, len = payload.len(), "queued out of order");
            conn.ooo.push((seq, payload.to_vec()));
            conn.ooo_bytes += payload.len();
        }
        return Ok(());
    }

    let skip = offset.unsigned_abs() as usize;
    if skip >= payload.len() {
        trace!(seq, len = payload.len(), "duplicate segment");
        return Ok(());
    }
    let taken = deliver(fcx, conn, &payload[skip..])?;
    conn.seq_from_tap = conn.seq_from_tap.wrapping_add(taken as u32);
    if taken < payload.len() - skip {
        return Ok(());
    }

    // Replay queued segments the new data reached.
    loop {
        let rcv = conn.seq_from_tap;
        let Some(pos) = conn
            .ooo
            .iter()
            .position(|(s, _)| s.wrapping_sub(rcv) as i32 <= 0)
        else {
            break;
        };
        let (s, data) = conn.ooo.swap_remove(pos);
        conn.ooo_bytes -= data.len();
        let skip = rcv.wrapping_sub(s) as usize;
        if skip >= data.len() {
            continue;
        }
        let tail = &data[skip..];
        let taken = deliver(fcx, conn, tail)?;
        conn.seq_from_tap = conn.seq_from_tap.wrapping_add(taken as u32);
        if taken < tail.len() {
            break;
        }
    }
    Ok(())
}

/// Hand guest bytes to the host socket, buffering what it cannot take yet. Returns how many
/// bytes were accepted; the rest is left for the guest to retransmit.
fn deliver<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    conn: &mut TapConn,
    data: &[u8],
) -> Result<usize> {
    let mut written = 0;
    if conn.to_sock.is_empty() {
        match fcx.host.send(conn.sock, data) {
            Ok(n) => written = n,
            Err(err) if would_block(&err) => {}
            Err(err) => return Err(TcpError::from_sock(err)),
        }
    }
    let room = (fcx.cfg.max_pending_to_sock as usize).saturating_sub(conn.to_sock.len());
    let queued = (data.len() - written).min(room);
    conn.to_sock.extend(&data[written..written + queued]);
    fcx.stats.bytes_from_tap += (written + queued) as u64;
    Ok(written + queued)
}

fn shutdown_if_flushed<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    conn: &mut TapConn,
) -> Result<()> {
    if conn.has(ConnFlags::TAP_FIN_RCVD)
        && !conn.has(ConnFlags::SOCK_SHUT_WR)
        && conn.to_sock.is_empty()
    {
        fcx.host
            .shutdown_write(conn.sock)
            .map_err(TcpError::from_sock)?;
        conn.flags.insert(ConnFlags::SOCK_SHUT_WR);
    }
    Ok(())
}

/// Send unsent host data within the guest's window. With `probe`, a closed window still lets
/// one byte through.
fn send_pending<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, conn: &mut TapConn, probe: bool) {
    if !conn.has(ConnFlags::SYN_ACKED) || conn.has(ConnFlags::TAP_FIN_SENT) {
        return;
    }
    let mss = conn.mss_to_tap.max(1) as usize;
    let mut probe = probe;
    while conn.unsent() > 0 {
        let mut allowed = (conn.wnd_from_tap as usize).saturating_sub(conn.sent);
        if allowed == 0 && probe && conn.sent == 0 {
            allowed = 1;
        }
        probe = false;
        let len = conn.unsent().min(allowed).min(mss);
        if len == 0 {
            break;
        }

        if conn.in_flight() == 0 {
            conn.rto_since = fcx.now;
        }
        let start = conn.sent;
        let data: Vec<u8> = conn.unacked.range(start..start + len).copied().collect();
        let seq = conn.seq_ack_from_tap.wrapping_add(start as u32);
        emit(fcx, conn, TcpFlags::ACK | TcpFlags::PSH, seq, &data);
        conn.sent += len;
        conn.advance_seq_to_tap(seq.wrapping_add(len as u32));
        fcx.stats.bytes_to_tap += len as u64;
    }
}

fn send_fin_if_done<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, index: u32, conn: &mut TapConn) {
    if !conn.has(ConnFlags::SOCK_EOF)
        || conn.has(ConnFlags::TAP_FIN_SENT)
        || !conn.has(ConnFlags::SYN_ACKED)
        || conn.unsent() > 0
    {
        return;
    }
    if conn.in_flight() == 0 {
        conn.rto_since = fcx.now;
    }
    let seq = conn.seq_to_tap;
    emit(fcx, conn, TcpFlags::FIN | TcpFlags::ACK, seq, &[]);
    conn.advance_seq_to_tap(seq.wrapping_add(1));
    conn.flags.insert(ConnFlags::TAP_FIN_SENT);
    if conn.phase == Phase::Established {
        conn.phase = Phase::Closing;
    }
    debug!(index, guest = %conn.key.guest, "FIN to guest");
}

/// Close the host socket and enter quiescence once both directions are done.
fn check_closed<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, conn: &mut TapConn) {
    if conn.phase == Phase::TimeWait || !conn.fully_closed() {
        return;
    }
    if conn.sock >= 0 {
        fcx.host.close(conn.sock);
        conn.sock = -1;
    }
    conn.interest = Interest::empty();
    conn.phase = Phase::TimeWait;
    conn.since = fcx.now;
    debug!(guest = %conn.key.guest, remote = %conn.key.remote, "time wait");
}

/// Read host data into the unacknowledged buffer and forward it.
fn sock_readable<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
) -> Result<()> {
    if !conn.has(ConnFlags::SYN_ACKED) || conn.has(ConnFlags::SOCK_EOF) {
        return Ok(());
    }
    let max = fcx.cfg.max_unacked_to_tap as usize;
    loop {
        let space = max.saturating_sub(conn.unacked.len());
        if space == 0 {
            trace!(index, "unacknowledged buffer full");
            break;
        }
        let len = space.min(fcx.scratch.len());
        match fcx.host.recv(conn.sock, &mut fcx.scratch[..len]) {
            Ok(0) => {
                debug!(index, peer = %conn.sock_peer, "EOF from host");
                conn.flags.insert(ConnFlags::SOCK_EOF);
                break;
            }
            Ok(n) => conn.unacked.extend(&fcx.scratch[..n]),
            Err(err) if would_block(&err) => break,
            Err(err) => return Err(TcpError::from_sock(err)),
        }
    }
    send_pending(fcx, conn, false);
    send_fin_if_done(fcx, index, conn);
    Ok(())
}

fn sock_writable<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    conn: &mut TapConn,
) -> Result<()> {
    let before = conn.wnd_to_tap;
    while !conn.to_sock.is_empty() {
        let (front, _) = conn.to_sock.as_slices();
        match fcx.host.send(conn.sock, front) {
            Ok(0) => break,
            Ok(n) => {
                conn.to_sock.drain(..n);
            }
            Err(err) if would_block(&err) => break,
            Err(err) => return Err(TcpError::from_sock(err)),
        }
    }
    shutdown_if_flushed(fcx, conn)?;

    // Let the guest know the window reopened.
    if conn.has(ConnFlags::SYN_ACKED) && !conn.has(ConnFlags::TAP_FIN_RCVD) {
        let now = window_to_tap(fcx, conn);
        if now > before {
            send_ack(fcx, conn);
        }
    }
    Ok(())
}

/// Readiness on the host socket of a tap-side flow.
pub(crate) fn sock_event<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
    events: Events,
) -> Verdict {
    conn.last_activity = fcx.now;

    if conn.phase == Phase::HostConnecting {
        if events.intersects(Events::OUT | Events::ERR | Events::HUP) {
            return connect_done(fcx, index, conn);
        }
        return Verdict::Keep;
    }

    if events.contains(Events::ERR) {
        let err = match fcx.host.take_error(conn.sock) {
            Ok(Some(err)) | Err(err) => TcpError::from_sock(err),
            Ok(None) => TcpError::PeerReset,
        };
        return abort(fcx, index, conn, err);
    }

    match conn.phase {
        Phase::TapSynSent => {
            if events.contains(Events::HUP) {
                return abort(fcx, index, conn, TcpError::PeerReset);
            }
            Verdict::Keep
        }
        Phase::Established | Phase::Closing => {
            let mut res = Ok(());
            if events.contains(Events::OUT) {
                res = sock_writable(fcx, conn);
            }
            if res.is_ok() && events.intersects(Events::IN | Events::RDHUP | Events::HUP) {
                res = sock_readable(fcx, index, conn);
            }
            if res.is_ok() && events.contains(Events::HUP) && !conn.has(ConnFlags::SOCK_SHUT_WR) {
                res = Err(TcpError::PeerReset);
            }
            if res.is_ok() {
                res = refresh_interest(fcx, index, conn);
                check_closed(fcx, conn);
            }
            guard(fcx, index, conn, res)
        }
        _ => Verdict::Keep,
    }
}

/// Deferred work: resume reading from a socket whose buffer the guest drained.
pub(crate) fn deferred<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
) -> Verdict {
    conn.flags.remove(ConnFlags::DEFERRED);
    if !matches!(conn.phase, Phase::Established | Phase::Closing) {
        return Verdict::Keep;
    }
    let mut res = sock_readable(fcx, index, conn);
    if res.is_ok() {
        res = refresh_interest(fcx, index, conn);
        check_closed(fcx, conn);
    }
    guard(fcx, index, conn, res)
}

/// Deadline expiry: retransmission, handshake and idle timeouts, end of quiescence.
pub(crate) fn on_timer<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut TapConn,
) -> Verdict {
    conn.deadline = None;
    let now = fcx.now;
    let cfg = fcx.cfg;

    match conn.phase {
        Phase::TimeWait => {
            if now >= conn.since + cfg.time_wait_ms {
                debug!(index, guest = %conn.key.guest, "closed");
                fcx.stats.flows_closed += 1;
                return Verdict::Release;
            }
        }
        Phase::TapSynRcvd | Phase::HostConnecting => {
            if now >= conn.since + cfg.handshake_timeout_ms {
                return abort(fcx, index, conn, TcpError::Timeout("connect"));
            }
        }
        Phase::Closed | Phase::Aborted => return Verdict::Release,
        _ => {
            let waiting = conn.in_flight() > 0 || (conn.unsent() > 0 && conn.wnd_from_tap == 0);
            if waiting {
                if now >= conn.rto_since + rto(cfg, conn.retries) {
                    if conn.retries >= cfg.max_retries {
                        return abort(fcx, index, conn, TcpError::Timeout("retransmission"));
                    }
                    conn.retries += 1;
                    fcx.stats.retransmissions += 1;
                    retransmit(fcx, index, conn);
                    conn.rto_since = now;
                }
            } else if conn.phase == Phase::Closing
                && now >= conn.last_activity + cfg.fin_timeout_ms
            {
                return abort(fcx, index, conn, TcpError::Timeout("close"));
            } else if now >= conn.last_activity + cfg.idle_timeout_ms {
                return abort(fcx, index, conn, TcpError::Timeout("idle"));
            }
        }
    }
    rearm(fcx, index, conn);
    Verdict::Keep
}

/// Go back to the oldest unacknowledged byte and send again.
fn retransmit<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, index: u32, conn: &mut TapConn) {
    trace!(index, retries = conn.retries, phase = ?conn.phase, "retransmitting");
    match conn.phase {
        Phase::TapSynSent => {
            let isn = conn.isn_to_tap;
            emit(fcx, conn, TcpFlags::SYN, isn, &[]);
        }
        Phase::Established if !conn.has(ConnFlags::SYN_ACKED) => {
            let isn = conn.isn_to_tap;
            emit(fcx, conn, TcpFlags::SYN | TcpFlags::ACK, isn, &[]);
        }
        _ => {
            conn.sent = 0;
            conn.seq_to_tap = conn.seq_ack_from_tap;
            if conn.has(ConnFlags::TAP_FIN_SENT) && !conn.has(ConnFlags::TAP_FIN_ACKED) {
                conn.flags.remove(ConnFlags::TAP_FIN_SENT);
            }
            send_pending(fcx, conn, true);
            send_fin_if_done(fcx, index, conn);
        }
    }
}
