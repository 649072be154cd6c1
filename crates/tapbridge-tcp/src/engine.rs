use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

use tracing::{debug, info, trace, warn};

use crate::config::TcpConfig;
use crate::conn::{Flow, Phase, SpliceConn, Verdict};
use crate::ctx::TcpCtx;
use crate::epoll_ref::{EpollRef, RefKind, Side};
use crate::error::TcpError;
use crate::flow::{self, FlowCtx};
use crate::hash::{FlowKey, HashSecret};
use crate::host::{would_block, Events, HostIo, RouteMirror};
use crate::listen::Listeners;
use crate::packet::{EthernetFrame, IpPacket, PacketError, TcpFlags, TcpSegment, IPPROTO_TCP};
use crate::splice;
use crate::stats::TcpStats;
use crate::table::ConnTable;
use crate::tap::TapIo;
use crate::timer::{tune_bufsize, Timers};
use crate::Millis;

/// Per-read copy buffer shared by all flows.
const SCRATCH_LEN: usize = 64 * 1024;

/// The TCP side of the bridge.
///
/// Everything runs on the caller's thread: each entry point handles one input to completion and
/// returns. Per-flow failures never escape; they end the affected flow and show up in
/// [`TcpEngine::stats`].
pub struct TcpEngine<H, T> {
    cfg: TcpConfig,
    ctx: TcpCtx,
    table: ConnTable,
    timers: Timers,
    stats: TcpStats,
    deferred: Vec<u32>,
    scratch: Vec<u8>,
    listeners: Listeners,
    host: H,
    tap: T,
}

impl<H: HostIo, T: TapIo> TcpEngine<H, T> {
    pub fn new(cfg: TcpConfig, host: H, tap: T) -> Self {
        Self::with_secret(cfg, host, tap, HashSecret::random())
    }

    /// Like [`TcpEngine::new`], with a fixed hash secret so sequence numbers are reproducible.
    pub fn with_secret(cfg: TcpConfig, host: H, tap: T, secret: HashSecret) -> Self {
        let ctx = TcpCtx::new(secret.clone(), cfg.fwd_in.clone(), cfg.fwd_out.clone());
        let table = ConnTable::new(cfg.capacity(), secret);
        Self {
            cfg,
            ctx,
            table,
            timers: Timers::new(),
            stats: TcpStats::default(),
            deferred: Vec::new(),
            scratch: vec![0; SCRATCH_LEN],
            listeners: Listeners::default(),
            host,
            tap,
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.cfg
    }

    pub fn ctx(&self) -> &TcpCtx {
        &self.ctx
    }

    pub fn stats(&self) -> &TcpStats {
        &self.stats
    }

    pub fn table(&self) -> &ConnTable {
        &self.table
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn tap(&self) -> &T {
        &self.tap
    }

    pub fn tap_mut(&mut self) -> &mut T {
        &mut self.tap
    }

    /// Earliest armed flow deadline.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    fn parts(&mut self, now: Millis) -> (&mut ConnTable, FlowCtx<'_, H, T>) {
        let fcx = FlowCtx {
            cfg: &self.cfg,
            ctx: &mut self.ctx,
            host: &mut self.host,
            tap: &mut self.tap,
            timers: &mut self.timers,
            stats: &mut self.stats,
            deferred: &mut self.deferred,
            scratch: &mut self.scratch,
            now,
        };
        (&mut self.table, fcx)
    }

    /// Probe kernel capabilities and open the listeners the rule sets ask for.
    pub fn init(&mut self, mirror: &mut dyn RouteMirror) {
        self.ctx.kernel_snd_wnd = self.host.probe_snd_wnd();
        if self.cfg.splice {
            self.ctx.pipe_size = splice::probe_pipe_size(&mut self.host);
        }
        self.listeners.bind(
            &self.cfg,
            &self.ctx.fwd_in,
            &self.ctx.fwd_out,
            &mut self.host,
            mirror,
        );
        tune_bufsize(&self.cfg, &mut self.ctx);
        info!(
            listeners = self.listeners.len(),
            capacity = self.table.capacity(),
            kernel_snd_wnd = self.ctx.kernel_snd_wnd,
            pipe_size = self.ctx.pipe_size,
            "TCP engine ready"
        );
    }

    /// Handle readiness for a token registered by the engine.
    pub fn dispatch(&mut self, token: u64, events: Events, now: Millis) {
        let r = match EpollRef::decode(token) {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %TcpError::from(err), "dropping event");
                self.stats.stale_events += 1;
                return;
            }
        };
        match r.kind {
            RefKind::Tcp { index, side } => self.sock_handler(index, side, r.fd, events, now),
            RefKind::TcpListen { port, ns } => self.listen_handler(r.fd, port, ns, now),
            kind => {
                debug!(?kind, "not a TCP reference");
                self.stats.stale_events += 1;
            }
        }
    }

    fn sock_handler(&mut self, index: u32, side: Side, fd: RawFd, events: Events, now: Millis) {
        let (table, mut fcx) = self.parts(now);
        let verdict = match table.get_mut(index) {
            Ok(record) if record.sock(side) == Some(fd) => match record {
                Flow::Tap(conn) => flow::sock_event(&mut fcx, index, conn, events),
                Flow::Splice(conn) => splice::sock_event(&mut fcx, index, conn, side, events),
            },
            _ => {
                trace!(index, fd, "event for a record that is gone");
                fcx.stats.stale_events += 1;
                return;
            }
        };
        settle(table, &mut fcx, index, verdict);
    }

    fn listen_handler(&mut self, fd: RawFd, port: u16, ns: bool, now: Millis) {
        if self.listeners.find(fd).is_none() {
            self.stats.stale_events += 1;
            return;
        }
        loop {
            let (sock, peer) = match self.host.accept(fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(err) if would_block(&err) => break,
                Err(err) => {
                    debug!(fd, error = %err, "accept failed");
                    break;
                }
            };
            self.accept_one(sock, peer, port, ns, now);
        }
    }

    fn accept_one(&mut self, sock: RawFd, peer: SocketAddr, port: u16, ns: bool, now: Millis) {
        let splice_to = if ns {
            Some((loopback(peer.is_ipv6(), port), false))
        } else if self.cfg.splice && peer.ip().is_loopback() {
            Some((loopback(peer.is_ipv6(), port), true))
        } else {
            None
        };

        let (table, mut fcx) = self.parts(now);
        if table.is_full() {
            debug!(%peer, port, "connection table full, closing accepted socket");
            fcx.stats.rejected += 1;
            fcx.host.close(sock);
            return;
        }

        let (index, verdict) = match splice_to {
            Some((dst, connect_ns)) => {
                let (target, done) = match fcx.host.connect(dst, connect_ns) {
                    Ok(res) => res,
                    Err(err) => {
                        let err = TcpError::HostConnectFailure(err);
                        debug!(%peer, %dst, error = %err, "splice connect failed");
                        fcx.stats.rejected += 1;
                        fcx.host.reset(sock);
                        return;
                    }
                };
                fcx.host.set_bufsize(sock, fcx.ctx.large_bufs);
                fcx.host.set_bufsize(target, fcx.ctx.large_bufs);
                let record = Flow::Splice(SpliceConn::new(sock, target, ns, now));
                let Some(index) = open(table, &mut fcx, record) else {
                    fcx.host.close(target);
                    fcx.host.close(sock);
                    return;
                };
                let verdict = match table.get_mut(index) {
                    Ok(Flow::Splice(conn)) => splice::start(&mut fcx, index, conn, done),
                    _ => return,
                };
                (index, verdict)
            }
            None => {
                let Some(conn) = flow::from_host_accept(&mut fcx, sock, peer, port) else {
                    debug!(%peer, "no guest address for this family");
                    fcx.stats.rejected += 1;
                    fcx.host.close(sock);
                    return;
                };
                let Some(index) = open(table, &mut fcx, Flow::Tap(conn)) else {
                    fcx.host.close(sock);
                    return;
                };
                let verdict = match table.get_mut(index) {
                    Ok(Flow::Tap(conn)) => flow::open_to_tap(&mut fcx, index, conn),
                    _ => return,
                };
                (index, verdict)
            }
        };
        settle(table, &mut fcx, index, verdict);
    }

    /// Handle a raw Ethernet frame from the tap. Returns whether it carried TCP.
    pub fn deliver_frame(&mut self, frame: &[u8], now: Millis) -> bool {
        let eth = match EthernetFrame::parse(frame) {
            Ok(eth) => eth,
            Err(err) => {
                trace!(reason = err.reason(), "short frame from tap");
                return false;
            }
        };
        let ip = match IpPacket::parse(eth.ethertype(), eth.payload()) {
            Ok(ip) => ip,
            Err(PacketError::Unsupported(_)) => return false,
            Err(err) => {
                trace!(reason = err.reason(), "bad IP header from tap");
                self.stats.malformed_segments += 1;
                return false;
            }
        };
        if ip.protocol != IPPROTO_TCP {
            return false;
        }
        self.tap_handler(ip.src, ip.dst, ip.payload, now);
        true
    }

    /// Handle one TCP segment sent by the guest from `src` to `dst`.
    pub fn tap_handler(&mut self, src: IpAddr, dst: IpAddr, segment: &[u8], now: Millis) {
        let seg = match TcpSegment::parse(segment) {
            Ok(seg) => seg,
            Err(err) => {
                let err = TcpError::MalformedSegment(err.reason());
                trace!(%src, %dst, error = %err, "dropping segment");
                self.stats.malformed_segments += 1;
                return;
            }
        };
        let key = FlowKey::new(
            SocketAddr::new(src, seg.src_port()),
            SocketAddr::new(dst, seg.dst_port()),
        );
        let flags = seg.flags();
        let fresh_syn = flags.contains(TcpFlags::SYN) && !flags.contains(TcpFlags::ACK);

        let (table, mut fcx) = self.parts(now);
        if let Some(index) = table.lookup(&key) {
            let handled = match table.get_mut(index) {
                Ok(Flow::Tap(conn)) if conn.phase == Phase::TimeWait && fresh_syn => None,
                Ok(Flow::Tap(conn)) => Some(flow::tap_segment(&mut fcx, index, conn, &seg)),
                _ => return,
            };
            if let Some(verdict) = handled {
                settle(table, &mut fcx, index, verdict);
                return;
            }
            debug!(index, guest = %key.guest, "new SYN ends time wait");
            fcx.stats.flows_closed += 1;
            settle(table, &mut fcx, index, Verdict::Release);
        }

        if !fresh_syn || flags.contains(TcpFlags::RST) {
            trace!(guest = %key.guest, remote = %key.remote, flags = flags.0, "segment for unknown flow");
            flow::reset_unknown(&mut fcx, &key, &seg);
            return;
        }

        let target = match flow::map_outbound(fcx.cfg, fcx.ctx, &key) {
            Ok(target) => target,
            Err(err) => {
                debug!(guest = %key.guest, remote = %key.remote, error = %err, "SYN rejected");
                fcx.stats.rejected += 1;
                flow::reset_unknown(&mut fcx, &key, &seg);
                return;
            }
        };
        let conn = flow::from_tap_syn(&mut fcx, key, &seg, target);
        let Some(index) = open(table, &mut fcx, Flow::Tap(conn)) else {
            flow::reset_unknown(&mut fcx, &key, &seg);
            return;
        };
        let verdict = match table.get_mut(index) {
            Ok(Flow::Tap(conn)) => flow::connect(&mut fcx, index, conn),
            _ => return,
        };
        settle(table, &mut fcx, index, verdict);
    }

    /// Periodic sweep: run every expired deadline and retune socket buffer sizing.
    pub fn timer(&mut self, now: Millis) {
        let due = self.timers.expired(now);
        let (table, mut fcx) = self.parts(now);
        for index in due {
            let verdict = match table.get_mut(index) {
                Ok(Flow::Tap(conn)) => flow::on_timer(&mut fcx, index, conn),
                Ok(Flow::Splice(conn)) => splice::on_timer(&mut fcx, index, conn),
                Err(_) => continue,
            };
            settle(table, &mut fcx, index, verdict);
        }
        fcx.ctx.timer_run = now;
        tune_bufsize(fcx.cfg, fcx.ctx);
    }

    /// End-of-batch work: resume flows whose backpressure cleared, then make indices released
    /// during the batch allocatable again.
    pub fn defer_handler(&mut self, now: Millis) {
        let pending = std::mem::take(&mut self.deferred);
        let (table, mut fcx) = self.parts(now);
        for index in pending {
            let verdict = match table.get_mut(index) {
                Ok(Flow::Tap(conn)) => flow::deferred(&mut fcx, index, conn),
                _ => continue,
            };
            settle(table, &mut fcx, index, verdict);
        }
        table.reclaim();
    }

    /// Abort every flow and close every listener.
    pub fn shutdown(&mut self, now: Millis) {
        let (table, mut fcx) = self.parts(now);
        for index in table.indices() {
            let verdict = match table.get_mut(index) {
                Ok(Flow::Tap(conn)) => flow::abort(&mut fcx, index, conn, TcpError::Shutdown),
                Ok(Flow::Splice(conn)) => splice::abort(&mut fcx, index, conn, TcpError::Shutdown),
                Err(_) => continue,
            };
            settle(table, &mut fcx, index, verdict);
        }
        table.reclaim();
        self.listeners.close_all(&mut self.host);
        info!(flows = self.stats.flows_opened, "TCP engine stopped");
    }
}

fn loopback(v6: bool, port: u16) -> SocketAddr {
    let ip = if v6 {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    SocketAddr::new(ip, port)
}

/// Insert a new record, counting it. `None` when the table is full.
fn open<H: HostIo, T: TapIo>(
    table: &mut ConnTable,
    fcx: &mut FlowCtx<'_, H, T>,
    record: Flow,
) -> Option<u32> {
    let splice = matches!(record, Flow::Splice(_));
    match table.allocate(record) {
        Ok(index) => {
            if splice {
                fcx.stats.active_splice += 1;
            } else {
                fcx.stats.active_tap += 1;
            }
            fcx.stats.flows_opened += 1;
            fcx.ctx.conn_count = table.len();
            Some(index)
        }
        Err(err) => {
            debug!(error = %err, "rejecting flow");
            fcx.stats.rejected += 1;
            None
        }
    }
}

/// Apply a handler's verdict: drop the record, its deadline and its hash entry.
fn settle<H: HostIo, T: TapIo>(
    table: &mut ConnTable,
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    verdict: Verdict,
) {
    if verdict == Verdict::Keep {
        return;
    }
    let record = match table.release(index) {
        Ok(record) => record,
        Err(err) => {
            debug!(error = %err, "release failed");
            return;
        }
    };
    fcx.timers.cancel(index, record.deadline());
    match record {
        Flow::Tap(_) => fcx.stats.active_tap = fcx.stats.active_tap.saturating_sub(1),
        Flow::Splice(_) => fcx.stats.active_splice = fcx.stats.active_splice.saturating_sub(1),
    }
    fcx.ctx.conn_count = table.len();
}
