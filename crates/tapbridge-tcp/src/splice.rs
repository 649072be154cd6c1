//! Spliced flows: both endpoints are local sockets, so bytes move between them with `splice(2)`
//! through a pair of pipes, never touching the tap.
//!
//! If pipes cannot be allocated for a connection, it copies through a bounded userspace buffer
//! instead.

use std::io;

use tracing::{debug, trace};

use crate::config::TcpConfig;
use crate::conn::{Phase, SpliceConn, SpliceFlags, Verdict};
use crate::epoll_ref::{EpollRef, Side};
use crate::error::{Result, TcpError};
use crate::flow::FlowCtx;
use crate::host::{would_block, Events, HostIo, Interest, Pipe};
use crate::tap::TapIo;
use crate::Millis;

/// Largest pipe size tried at start-up.
pub const MAX_PIPE_SIZE: usize = 8 * 1024 * 1024;
const MIN_PIPE_SIZE: usize = 4096;

/// Find the largest pipe size the system grants, halving from [`MAX_PIPE_SIZE`]. Zero when no
/// pipe can be created at all.
pub fn probe_pipe_size<H: HostIo>(host: &mut H) -> usize {
    let mut size = MAX_PIPE_SIZE;
    while size >= MIN_PIPE_SIZE {
        match host.pipe(size) {
            Ok(pipe) => {
                host.close(pipe.read);
                host.close(pipe.write);
                return size;
            }
            Err(err) => {
                trace!(size, error = %err, "pipe size refused");
                size /= 2;
            }
        }
    }
    0
}

fn alloc_pipes<H: HostIo>(host: &mut H, size: usize) -> io::Result<[Pipe; 2]> {
    let first = host.pipe(size)?;
    match host.pipe(size) {
        Ok(second) => Ok([first, second]),
        Err(err) => {
            host.close(first.read);
            host.close(first.write);
            Err(err)
        }
    }
}

fn close_pipes<H: HostIo>(host: &mut H, conn: &mut SpliceConn) {
    if let Some(pipes) = conn.pipes.take() {
        for pipe in pipes {
            host.close(pipe.read);
            host.close(pipe.write);
        }
    }
}

fn queued(conn: &SpliceConn, from: Side) -> usize {
    let dir = &conn.dirs[from.slot()];
    match conn.pipes {
        Some(_) => dir.pending,
        None => dir.bounce.len(),
    }
}

/// Register both sockets of a freshly accepted spliced connection and wait for the connect.
pub(crate) fn start<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
    connected: bool,
) -> Verdict {
    let res = watch(fcx, index, conn, Side::Primary, Interest::empty())
        .and_then(|()| watch(fcx, index, conn, Side::Secondary, Interest::WRITE));
    if let Err(err) = res {
        return abort(fcx, index, conn, err);
    }
    debug!(index, ns = conn.ns, "splicing");
    if connected {
        return connect_done(fcx, index, conn);
    }
    rearm(fcx, index, conn);
    Verdict::Keep
}

fn watch<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
    side: Side,
    interest: Interest,
) -> Result<()> {
    let fd = conn.sock(side);
    let token = EpollRef::tcp(index, side, fd).encode()?;
    fcx.host
        .watch(fd, token, interest)
        .map_err(TcpError::ResourceAllocationFailure)?;
    conn.interest[side.slot()] = interest;
    Ok(())
}

fn set_interest<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
    side: Side,
    interest: Interest,
) -> Result<()> {
    if conn.interest[side.slot()] == interest {
        return Ok(());
    }
    let fd = conn.sock(side);
    let token = EpollRef::tcp(index, side, fd).encode()?;
    fcx.host
        .rewatch(fd, token, interest)
        .map_err(TcpError::ResourceAllocationFailure)?;
    conn.interest[side.slot()] = interest;
    Ok(())
}

/// Read from a side only while its direction has nothing left over; watch for writability on a
/// side while the opposite direction is stuck.
fn refresh_interest<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
) -> Result<()> {
    for side in [Side::Primary, Side::Secondary] {
        let mut interest = Interest::empty();
        if !conn.has(side, SpliceFlags::EOF) && queued(conn, side) == 0 {
            interest |= Interest::READ;
        }
        if queued(conn, side.other()) > 0 {
            interest |= Interest::WRITE;
        }
        set_interest(fcx, index, conn, side, interest)?;
    }
    Ok(())
}

fn next_deadline(cfg: &TcpConfig, conn: &SpliceConn) -> Option<Millis> {
    match conn.phase {
        Phase::HostConnecting => Some(conn.since + cfg.handshake_timeout_ms),
        Phase::Closing => Some(conn.last_activity + cfg.fin_timeout_ms),
        Phase::Established => Some(conn.last_activity + cfg.idle_timeout_ms),
        _ => None,
    }
}

fn rearm<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, index: u32, conn: &mut SpliceConn) {
    let next = next_deadline(fcx.cfg, conn);
    conn.deadline = fcx.timers.rearm(index, conn.deadline, next);
}

/// Reset both sockets and free the pipes.
pub(crate) fn abort<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
    err: TcpError,
) -> Verdict {
    debug!(index, phase = ?conn.phase, error = %err, "aborting spliced flow");
    close_pipes(fcx.host, conn);
    for fd in conn.socks {
        fcx.host.reset(fd);
    }
    conn.phase = Phase::Aborted;
    fcx.stats.flows_aborted += 1;
    Verdict::Release
}

fn close<H: HostIo, T: TapIo>(fcx: &mut FlowCtx<'_, H, T>, index: u32, conn: &mut SpliceConn) -> Verdict {
    debug!(index, "spliced flow closed");
    close_pipes(fcx.host, conn);
    for fd in conn.socks {
        fcx.host.close(fd);
    }
    conn.phase = Phase::Closed;
    fcx.stats.flows_closed += 1;
    Verdict::Release
}

fn connect_done<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
) -> Verdict {
    match fcx.host.take_error(conn.sock(Side::Secondary)) {
        Ok(None) => {}
        Ok(Some(err)) | Err(err) => {
            return abort(fcx, index, conn, TcpError::HostConnectFailure(err));
        }
    }

    conn.phase = Phase::Established;
    conn.since = fcx.now;
    let size = fcx.ctx.pipe_size;
    let pipes = if size == 0 {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    } else {
        alloc_pipes(fcx.host, size)
    };
    match pipes {
        Ok(pipes) => conn.pipes = Some(pipes),
        Err(err) => {
            let err = TcpError::ResourceAllocationFailure(err);
            debug!(index, error = %err, "copying through userspace");
            fcx.stats.splice_fallbacks += 1;
        }
    }

    let res = forward(fcx, conn, Side::Primary)
        .and_then(|()| forward(fcx, conn, Side::Secondary));
    finish(fcx, index, conn, res)
}

/// Common tail of every event: update interest, close when both directions are done.
fn finish<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
    res: Result<()>,
) -> Verdict {
    if let Err(err) = res.and_then(|()| refresh_interest(fcx, index, conn)) {
        return abort(fcx, index, conn, err);
    }
    if conn.both_closed() {
        return close(fcx, index, conn);
    }
    if conn.has(Side::Primary, SpliceFlags::SHUT_WR) || conn.has(Side::Secondary, SpliceFlags::SHUT_WR) {
        conn.phase = Phase::Closing;
    }
    rearm(fcx, index, conn);
    Verdict::Keep
}

/// Move as much as possible from `from` to the other side.
fn forward<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    conn: &mut SpliceConn,
    from: Side,
) -> Result<()> {
    let to = from.other();
    let src = conn.sock(from);
    let dst = conn.sock(to);
    let d = from.slot();

    loop {
        let mut progress = false;

        if !conn.has(from, SpliceFlags::EOF) {
            let read = match conn.pipes {
                Some(pipes) => {
                    let room = fcx.ctx.pipe_size.saturating_sub(conn.dirs[d].pending);
                    if room == 0 {
                        None
                    } else {
                        Some(fcx.host.splice(src, pipes[d].write, room, true))
                    }
                }
                None => {
                    let room = (fcx.cfg.splice_fallback_buf as usize)
                        .saturating_sub(conn.dirs[d].bounce.len())
                        .min(fcx.scratch.len());
                    if room == 0 {
                        None
                    } else {
                        Some(fcx.host.recv(src, &mut fcx.scratch[..room]))
                    }
                }
            };
            match read {
                None => {}
                Some(Ok(0)) => {
                    trace!(side = ?from, "EOF on spliced socket");
                    conn.flags[d].insert(SpliceFlags::EOF);
                }
                Some(Ok(n)) => {
                    progress = true;
                    match conn.pipes {
                        Some(_) => conn.dirs[d].pending += n,
                        None => conn.dirs[d].bounce.extend(&fcx.scratch[..n]),
                    }
                }
                Some(Err(err)) if would_block(&err) => {}
                Some(Err(err)) => return Err(TcpError::from_sock(err)),
            }
        }

        if queued(conn, from) > 0 {
            let written = match conn.pipes {
                Some(pipes) => {
                    let pending = conn.dirs[d].pending;
                    fcx.host.splice(pipes[d].read, dst, pending, false)
                }
                None => {
                    let (front, _) = conn.dirs[d].bounce.as_slices();
                    fcx.host.send(dst, front)
                }
            };
            match written {
                Ok(n) => {
                    if n > 0 {
                        progress = true;
                    }
                    match conn.pipes {
                        Some(_) => conn.dirs[d].pending -= n,
                        None => {
                            conn.dirs[d].bounce.drain(..n);
                        }
                    }
                    fcx.stats.bytes_spliced += n as u64;
                }
                Err(err) if would_block(&err) => break,
                Err(err) => return Err(TcpError::from_sock(err)),
            }
        }

        if !progress {
            break;
        }
    }

    if conn.has(from, SpliceFlags::EOF)
        && queued(conn, from) == 0
        && !conn.has(to, SpliceFlags::SHUT_WR)
    {
        fcx.host.shutdown_write(dst).map_err(TcpError::from_sock)?;
        conn.flags[to.slot()].insert(SpliceFlags::SHUT_WR);
    }
    Ok(())
}

/// Readiness on either socket of a spliced flow.
pub(crate) fn sock_event<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
    side: Side,
    events: Events,
) -> Verdict {
    conn.last_activity = fcx.now;

    if conn.phase == Phase::HostConnecting {
        return match side {
            Side::Secondary if events.intersects(Events::OUT | Events::ERR | Events::HUP) => {
                connect_done(fcx, index, conn)
            }
            Side::Primary if events.intersects(Events::ERR | Events::HUP) => {
                abort(fcx, index, conn, TcpError::PeerReset)
            }
            _ => Verdict::Keep,
        };
    }

    if events.contains(Events::ERR) {
        let err = match fcx.host.take_error(conn.sock(side)) {
            Ok(Some(err)) | Err(err) => TcpError::from_sock(err),
            Ok(None) => TcpError::PeerReset,
        };
        return abort(fcx, index, conn, err);
    }

    let mut res = Ok(());
    if events.contains(Events::OUT) {
        res = forward(fcx, conn, side.other());
    }
    if res.is_ok() && events.intersects(Events::IN | Events::RDHUP | Events::HUP) {
        res = forward(fcx, conn, side);
    }
    finish(fcx, index, conn, res)
}

pub(crate) fn on_timer<H: HostIo, T: TapIo>(
    fcx: &mut FlowCtx<'_, H, T>,
    index: u32,
    conn: &mut SpliceConn,
) -> Verdict {
    conn.deadline = None;
    match next_deadline(fcx.cfg, conn) {
        Some(at) if fcx.now >= at => {
            let what = match conn.phase {
                Phase::HostConnecting => "connect",
                Phase::Closing => "close",
                _ => "idle",
            };
            abort(fcx, index, conn, TcpError::Timeout(what))
        }
        Some(_) => {
            rearm(fcx, index, conn);
            Verdict::Keep
        }
        None => Verdict::Release,
    }
}
