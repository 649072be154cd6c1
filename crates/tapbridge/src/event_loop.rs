//! The single dispatch thread: one epoll instance for the tap, the timer, the signal descriptor
//! and every socket the engine owns.

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::epoll::EpollEvent;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tapbridge_pcap::{capture_path, PcapWriter};
use tapbridge_tcp::{
    EpollRef, HostIo, Interest, Millis, NoMirror, RefKind, TcpEngine, TcpStats,
};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::netns::{Namespaces, NetnsMirror};
use crate::sys::{self, LinuxHost};
use crate::tap::{QemuTap, TapError};

const MAX_EVENTS: usize = 256;

type Engine = TcpEngine<LinuxHost, QemuTap>;

/// Milliseconds since the loop started.
#[derive(Debug, Clone, Copy)]
struct Clock(Instant);

impl Clock {
    fn now(&self) -> Millis {
        self.0.elapsed().as_millis() as Millis
    }
}

fn tap_token(fd: RawFd) -> Result<u64> {
    Ok(EpollRef::new(RefKind::Tap, fd).encode()?)
}

/// Point the tap registration at whichever descriptor the tap currently listens on.
fn rewatch_tap(engine: &mut Engine, old: Option<RawFd>) -> Result<Option<RawFd>> {
    let fd = engine.tap().fd();
    if fd == old {
        return Ok(fd);
    }
    if let Some(old) = old {
        engine.host_mut().unwatch(old);
    }
    if let Some(fd) = fd {
        let token = tap_token(fd)?;
        engine
            .host_mut()
            .watch(fd, token, Interest::READ)
            .context("failed to watch tap")?;
    }
    Ok(fd)
}

/// Flush queued frames; watch for writability while some remain.
fn flush_tap(engine: &mut Engine, tap_fd: Option<RawFd>) -> Result<()> {
    if let Err(err) = engine.tap_mut().flush() {
        warn!(error = %err, "tap write failed");
        engine.tap_mut().disconnect();
        return Ok(());
    }
    let Some(fd) = tap_fd else {
        return Ok(());
    };
    let mut interest = Interest::READ;
    if engine.tap().has_pending() {
        interest |= Interest::WRITE;
    }
    let token = tap_token(fd)?;
    engine
        .host_mut()
        .rewatch(fd, token, interest)
        .context("failed to update tap interest")?;
    Ok(())
}

fn tap_readable(engine: &mut Engine, now: Millis) -> Result<()> {
    if !engine.tap().is_connected() {
        engine.tap_mut().accept().context("failed to accept hypervisor")?;
        return Ok(());
    }
    match engine.tap_mut().receive() {
        Ok(frames) => {
            for frame in frames {
                engine.deliver_frame(&frame, now);
            }
        }
        Err(TapError::Io(err)) => {
            warn!(error = %err, "tap read failed");
            engine.tap_mut().disconnect();
        }
        Err(err) => {
            info!(reason = %err, "dropping hypervisor connection");
            engine.tap_mut().disconnect();
        }
    }
    Ok(())
}

fn log_stats(stats: &TcpStats) {
    info!(
        active_tap = stats.active_tap,
        active_splice = stats.active_splice,
        opened = stats.flows_opened,
        closed = stats.flows_closed,
        aborted = stats.flows_aborted,
        rejected = stats.rejected,
        resets = stats.resets_to_tap,
        retransmissions = stats.retransmissions,
        malformed = stats.malformed_segments,
        from_tap = stats.bytes_from_tap,
        to_tap = stats.bytes_to_tap,
        spliced = stats.bytes_spliced,
        "TCP statistics"
    );
}

/// Run the bridge until SIGINT or SIGTERM. Returns the final statistics.
pub fn run(cfg: BridgeConfig) -> Result<TcpStats> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("failed to block signals")?;
    let mut signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("failed to create signalfd")?;

    let timer = TimerFd::new(
        ClockId::CLOCK_MONOTONIC,
        TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
    )
    .context("failed to create timerfd")?;
    let interval = TimeSpec::from_duration(Duration::from_millis(cfg.tcp.timer_interval_ms));
    timer
        .set(Expiration::Interval(interval), TimerSetTimeFlags::empty())
        .context("failed to arm timerfd")?;

    let namespaces = match &cfg.netns {
        Some(path) => Some(Rc::new(Namespaces::open(path).with_context(|| {
            format!("failed to open network namespace {}", path.display())
        })?)),
        None => None,
    };

    let host = LinuxHost::new(namespaces.clone()).context("failed to create epoll instance")?;
    let mut tap = QemuTap::bind(&cfg.socket_path, cfg.our_mac)
        .with_context(|| format!("failed to listen on {}", cfg.socket_path.display()))?;
    if let Some(path) = &cfg.pcap {
        let path = capture_path(path, 1);
        match PcapWriter::create(&path) {
            Ok(writer) => tap.set_capture(Box::new(writer)),
            Err(err) => warn!(path = %path.display(), error = %err, "packet capture disabled"),
        }
    }

    let clock = Clock(Instant::now());
    let mut engine = TcpEngine::new(cfg.tcp.clone(), host, tap);
    match &namespaces {
        Some(ns) => engine.init(&mut NetnsMirror::new(Rc::clone(ns))),
        None => engine.init(&mut NoMirror),
    }

    let timer_fd = timer.as_fd().as_raw_fd();
    let signal_fd = signals.as_raw_fd();
    for (kind, fd) in [(RefKind::Timer, timer_fd), (RefKind::Signal, signal_fd)] {
        let token = EpollRef::new(kind, fd).encode()?;
        engine
            .host_mut()
            .watch(fd, token, Interest::READ)
            .with_context(|| format!("failed to watch {kind:?}"))?;
    }
    let mut tap_fd = rewatch_tap(&mut engine, None)?;

    let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
    'outer: loop {
        let n = engine
            .host()
            .wait(&mut events, -1)
            .context("epoll_wait failed")?;
        let now = clock.now();

        for event in &events[..n] {
            let token = event.data();
            let ready = sys::events(event.events());
            match EpollRef::decode(token).map(|r| r.kind) {
                Ok(RefKind::Signal) => {
                    if let Ok(Some(info)) = signals.read_signal() {
                        info!(signal = info.ssi_signo, "shutting down");
                    }
                    break 'outer;
                }
                Ok(RefKind::Timer) => {
                    // Expirations are counted, not queued; one sweep covers them all.
                    let _ = timer.wait();
                    engine.timer(now);
                }
                Ok(RefKind::Tap) => {
                    if ready.intersects(tapbridge_tcp::Events::IN | tapbridge_tcp::Events::HUP) {
                        tap_readable(&mut engine, now)?;
                    }
                }
                _ => engine.dispatch(token, ready, now),
            }
        }

        engine.defer_handler(now);
        tap_fd = rewatch_tap(&mut engine, tap_fd)?;
        flush_tap(&mut engine, tap_fd)?;
        debug!(events = n, conns = engine.table().len(), "batch done");
    }

    let now = clock.now();
    engine.shutdown(now);
    if let Err(err) = engine.tap_mut().flush() {
        debug!(error = %err, "final tap flush failed");
    }
    let stats = engine.stats().clone();
    log_stats(&stats);
    Ok(stats)
}
