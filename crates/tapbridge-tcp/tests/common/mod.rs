#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;

use tapbridge_tcp::packet::{TcpFlags, TcpOptions, TcpSegment, TcpSegmentBuilder};
use tapbridge_tcp::{
    Events, HashSecret, HostIo, Interest, Millis, Pipe, SockWindow, TapFrame, TapIo, TcpConfig,
    TcpEngine,
};

pub const SECRET: [u8; 32] = [0x5a; 32];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One end of an in-memory TCP connection, as the engine sees it.
#[derive(Debug, Default)]
pub struct FakeSock {
    /// Remote address for connected sockets, bind address for listeners.
    pub addr: Option<SocketAddr>,
    pub ns: bool,
    pub listener: bool,
    pub backlog: VecDeque<(RawFd, SocketAddr)>,

    /// Bytes waiting to be read by the engine.
    pub rx: VecDeque<u8>,
    /// Bytes the engine wrote.
    pub tx: Vec<u8>,
    /// Further writes accepted before the socket reports would-block. `None` is unbounded.
    pub send_cap: Option<usize>,
    pub peer_eof: bool,
    pub peer_reset: bool,
    pub error: Option<io::ErrorKind>,

    pub shut_wr: bool,
    pub closed: bool,
    pub reset: bool,
    pub large_bufs: Option<bool>,
}

#[derive(Debug, Default)]
struct FakePipe {
    buf: VecDeque<u8>,
    cap: usize,
    read_closed: bool,
    write_closed: bool,
}

/// In-memory [`HostIo`].
#[derive(Debug)]
pub struct FakeHost {
    next_fd: RawFd,
    pub socks: BTreeMap<RawFd, FakeSock>,
    pipes: BTreeMap<usize, FakePipe>,
    /// Pipe descriptor to (pipe, is read end).
    pipe_ends: BTreeMap<RawFd, (usize, bool)>,
    pub watched: BTreeMap<RawFd, (u64, Interest)>,

    pub connects: Vec<(SocketAddr, bool, RawFd)>,
    pub refuse: BTreeSet<SocketAddr>,
    pub connect_immediately: bool,
    /// Largest pipe the host grants; zero makes every pipe fail.
    pub max_pipe: usize,
    pub reports_snd_wnd: bool,
    pub sndbuf: u32,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            next_fd: 10,
            socks: BTreeMap::new(),
            pipes: BTreeMap::new(),
            pipe_ends: BTreeMap::new(),
            watched: BTreeMap::new(),
            connects: Vec::new(),
            refuse: BTreeSet::new(),
            connect_immediately: false,
            max_pipe: 1 << 20,
            reports_snd_wnd: false,
            sndbuf: 256 * 1024,
        }
    }
}

impl FakeHost {
    fn alloc_fd(&mut self) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    pub fn sock(&self, fd: RawFd) -> &FakeSock {
        &self.socks[&fd]
    }

    pub fn sock_mut(&mut self, fd: RawFd) -> &mut FakeSock {
        self.socks.get_mut(&fd).expect("unknown socket")
    }

    /// Queue an incoming connection on the listener bound to `port`. Returns the accepted fd.
    pub fn incoming(&mut self, port: u16, ns: bool, peer: SocketAddr) -> RawFd {
        let fd = self.alloc_fd();
        self.socks.insert(
            fd,
            FakeSock {
                addr: Some(peer),
                ..FakeSock::default()
            },
        );
        let listener = self
            .socks
            .values_mut()
            .find(|s| s.listener && s.ns == ns && s.addr.map(|a| a.port()) == Some(port))
            .expect("no listener on port");
        listener.backlog.push_back((fd, peer));
        fd
    }

    pub fn listener_fd(&self, port: u16, ns: bool) -> RawFd {
        *self
            .socks
            .iter()
            .find(|(_, s)| s.listener && s.ns == ns && s.addr.map(|a| a.port()) == Some(port))
            .expect("no listener on port")
            .0
    }

    pub fn open_pipes(&self) -> usize {
        self.pipes
            .values()
            .filter(|p| !p.read_closed || !p.write_closed)
            .count()
    }

    /// Events the engine asked for that are currently true, like a level-triggered epoll.
    pub fn ready(&self) -> Vec<(u64, Events)> {
        let mut out = Vec::new();
        for (fd, (token, interest)) in &self.watched {
            let Some(sock) = self.socks.get(fd) else { continue };
            let mut events = Events::empty();
            if sock.error.is_some() || sock.peer_reset {
                events |= Events::ERR | Events::HUP;
            }
            if interest.contains(Interest::READ) {
                if !sock.rx.is_empty() || !sock.backlog.is_empty() {
                    events |= Events::IN;
                }
                if sock.peer_eof {
                    events |= Events::IN | Events::RDHUP;
                }
            }
            if sock.peer_eof && sock.shut_wr {
                events |= Events::HUP;
            }
            if interest.contains(Interest::WRITE) && sock.send_cap != Some(0) {
                events |= Events::OUT;
            }
            if !events.is_empty() {
                out.push((*token, events));
            }
        }
        out
    }

    fn pipe_of(&mut self, fd: RawFd) -> Option<&mut FakePipe> {
        let (id, _) = *self.pipe_ends.get(&fd)?;
        self.pipes.get_mut(&id)
    }
}

impl HostIo for FakeHost {
    fn connect(&mut self, dst: SocketAddr, ns: bool) -> io::Result<(RawFd, bool)> {
        if self.refuse.contains(&dst) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let fd = self.alloc_fd();
        self.socks.insert(
            fd,
            FakeSock {
                addr: Some(dst),
                ns,
                ..FakeSock::default()
            },
        );
        self.connects.push((dst, ns, fd));
        Ok((fd, self.connect_immediately))
    }

    fn take_error(&mut self, fd: RawFd) -> io::Result<Option<io::Error>> {
        let sock = self.socks.get_mut(&fd).ok_or(io::ErrorKind::NotFound)?;
        Ok(sock.error.take().map(io::Error::from))
    }

    fn listen(&mut self, addr: SocketAddr, ns: bool) -> io::Result<RawFd> {
        let fd = self.alloc_fd();
        self.socks.insert(
            fd,
            FakeSock {
                addr: Some(addr),
                ns,
                listener: true,
                ..FakeSock::default()
            },
        );
        Ok(fd)
    }

    fn accept(&mut self, fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
        let sock = self.socks.get_mut(&fd).ok_or(io::ErrorKind::NotFound)?;
        Ok(sock.backlog.pop_front())
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let sock = self.socks.get_mut(&fd).ok_or(io::ErrorKind::NotFound)?;
        if sock.peer_reset {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        if sock.rx.is_empty() {
            if sock.peer_eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(sock.rx.len());
        for (dst, src) in buf.iter_mut().zip(sock.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn send(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize> {
        let sock = self.socks.get_mut(&fd).ok_or(io::ErrorKind::NotFound)?;
        if sock.peer_reset {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        if sock.shut_wr || sock.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match sock.send_cap {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(cap) => {
                let n = cap.min(data.len());
                sock.send_cap = Some(cap - n);
                n
            }
            None => data.len(),
        };
        sock.tx.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn shutdown_write(&mut self, fd: RawFd) -> io::Result<()> {
        let sock = self.socks.get_mut(&fd).ok_or(io::ErrorKind::NotFound)?;
        sock.shut_wr = true;
        Ok(())
    }

    fn close(&mut self, fd: RawFd) {
        self.watched.remove(&fd);
        if let Some(sock) = self.socks.get_mut(&fd) {
            sock.closed = true;
            return;
        }
        if let Some((id, read)) = self.pipe_ends.remove(&fd) {
            let pipe = self.pipes.get_mut(&id).expect("pipe");
            if read {
                pipe.read_closed = true;
            } else {
                pipe.write_closed = true;
            }
        }
    }

    fn reset(&mut self, fd: RawFd) {
        if let Some(sock) = self.socks.get_mut(&fd) {
            sock.reset = true;
        }
        self.close(fd);
    }

    fn window(&mut self, fd: RawFd) -> io::Result<SockWindow> {
        let sndbuf = self.sndbuf;
        let reports = self.reports_snd_wnd;
        let sock = self.socks.get(&fd).ok_or(io::ErrorKind::NotFound)?;
        let sndbuf = match sock.send_cap {
            Some(cap) => (cap as u32).min(sndbuf),
            None => sndbuf,
        };
        Ok(SockWindow {
            snd_wnd: reports.then_some(sndbuf),
            unsent: 0,
            queued: 0,
            sndbuf,
        })
    }

    fn set_bufsize(&mut self, fd: RawFd, large: bool) {
        if let Some(sock) = self.socks.get_mut(&fd) {
            sock.large_bufs = Some(large);
        }
    }

    fn pipe(&mut self, size: usize) -> io::Result<Pipe> {
        if size > self.max_pipe {
            return Err(io::ErrorKind::PermissionDenied.into());
        }
        let id = self.pipes.len();
        self.pipes.insert(
            id,
            FakePipe {
                cap: size,
                ..FakePipe::default()
            },
        );
        let read = self.alloc_fd();
        let write = self.alloc_fd();
        self.pipe_ends.insert(read, (id, true));
        self.pipe_ends.insert(write, (id, false));
        Ok(Pipe { read, write })
    }

    fn splice(&mut self, from: RawFd, to: RawFd, len: usize, _more: bool) -> io::Result<usize> {
        if self.socks.contains_key(&from) {
            // Socket into pipe.
            let sock = self.socks.get_mut(&from).ok_or(io::ErrorKind::NotFound)?;
            if sock.peer_reset {
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            if sock.rx.is_empty() {
                if sock.peer_eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let mut taken: Vec<u8> = Vec::new();
            let room = {
                let (id, _) = *self.pipe_ends.get(&to).ok_or(io::ErrorKind::NotFound)?;
                let pipe = &self.pipes[&id];
                pipe.cap - pipe.buf.len()
            };
            let sock = self.socks.get_mut(&from).ok_or(io::ErrorKind::NotFound)?;
            let n = len.min(room).min(sock.rx.len());
            if n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            taken.extend(sock.rx.drain(..n));
            let pipe = self.pipe_of(to).ok_or(io::ErrorKind::NotFound)?;
            pipe.buf.extend(taken);
            Ok(n)
        } else {
            // Pipe into socket.
            let available = {
                let pipe = self.pipe_of(from).ok_or(io::ErrorKind::NotFound)?;
                pipe.buf.len().min(len)
            };
            if available == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let chunk: Vec<u8> = {
                let pipe = self.pipe_of(from).ok_or(io::ErrorKind::NotFound)?;
                pipe.buf.iter().take(available).copied().collect()
            };
            let n = self.send(to, &chunk)?;
            let pipe = self.pipe_of(from).ok_or(io::ErrorKind::NotFound)?;
            pipe.buf.drain(..n);
            Ok(n)
        }
    }

    fn probe_snd_wnd(&mut self) -> bool {
        self.reports_snd_wnd
    }

    fn watch(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        if self.watched.insert(fd, (token, interest)).is_some() {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        Ok(())
    }

    fn rewatch(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        match self.watched.get_mut(&fd) {
            Some(entry) => {
                *entry = (token, interest);
                Ok(())
            }
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn unwatch(&mut self, fd: RawFd) {
        self.watched.remove(&fd);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub payload: Vec<u8>,
    pub flow: u32,
}

impl SentFrame {
    pub fn segment(&self) -> TcpSegment<'_> {
        TcpSegment::parse(&self.payload).expect("engine emitted a bad segment")
    }
}

/// [`TapIo`] that keeps every frame for inspection.
#[derive(Debug, Default)]
pub struct RecordingTap {
    pub frames: Vec<SentFrame>,
}

impl RecordingTap {
    pub fn take(&mut self) -> Vec<SentFrame> {
        std::mem::take(&mut self.frames)
    }
}

impl TapIo for RecordingTap {
    fn send_frame(&mut self, frame: TapFrame<'_>) {
        self.frames.push(SentFrame {
            src: frame.src,
            dst: frame.dst,
            protocol: frame.protocol,
            payload: frame.payload.to_vec(),
            flow: frame.flow,
        });
    }
}

pub type Engine = TcpEngine<FakeHost, RecordingTap>;

pub fn engine(cfg: TcpConfig) -> Engine {
    init_tracing();
    let mut engine = TcpEngine::with_secret(
        cfg,
        FakeHost::default(),
        RecordingTap::default(),
        HashSecret::from_bytes(SECRET),
    );
    engine.init(&mut tapbridge_tcp::NoMirror);
    engine
}

/// Deliver every ready event until the host goes quiet, then run the deferred handler.
pub fn pump(engine: &mut Engine, now: Millis) {
    for _ in 0..64 {
        let ready = engine.host().ready();
        if ready.is_empty() {
            break;
        }
        for (token, events) in ready {
            engine.dispatch(token, events, now);
        }
        engine.defer_handler(now);
    }
    engine.defer_handler(now);
}

pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

/// The guest end of one connection.
#[derive(Debug, Clone, Copy)]
pub struct Guest {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Next sequence number the guest sends.
    pub seq: u32,
    /// Next sequence number the guest expects.
    pub ack: u32,
    /// Raw window field the guest advertises.
    pub window: u16,
}

impl Guest {
    pub fn new(local_port: u16, remote: SocketAddr, isn: u32) -> Self {
        Self {
            local: SocketAddr::new(IpAddr::V4(GUEST_IP), local_port),
            remote,
            seq: isn,
            ack: 0,
            window: 512,
        }
    }

    pub fn segment(&self, seq: u32, flags: TcpFlags, options: &[u8], payload: &[u8]) -> Vec<u8> {
        TcpSegmentBuilder::new(self.local.port(), self.remote.port(), seq, self.ack, flags)
            .window(self.window)
            .options(options)
            .payload(payload)
            .build(self.local.ip(), self.remote.ip())
            .expect("build guest segment")
    }

    fn deliver(&self, engine: &mut Engine, bytes: &[u8], now: Millis) {
        engine.tap_handler(self.local.ip(), self.remote.ip(), bytes, now);
    }

    /// SYN with MSS 1460 and window scale 7.
    pub fn syn(&mut self, engine: &mut Engine, now: Millis) {
        let opts = TcpOptions {
            mss: Some(1460),
            wscale: Some(7),
        }
        .encode();
        let bytes = self.segment(self.seq, TcpFlags::SYN, &opts, &[]);
        self.seq = self.seq.wrapping_add(1);
        self.deliver(engine, &bytes, now);
    }

    /// SYN|ACK answering an engine SYN with initial sequence `their_isn`.
    pub fn syn_ack(&mut self, engine: &mut Engine, their_isn: u32, now: Millis) {
        self.ack = their_isn.wrapping_add(1);
        let opts = TcpOptions {
            mss: Some(1460),
            wscale: Some(7),
        }
        .encode();
        let bytes = self.segment(self.seq, TcpFlags::SYN | TcpFlags::ACK, &opts, &[]);
        self.seq = self.seq.wrapping_add(1);
        self.deliver(engine, &bytes, now);
    }

    pub fn send_ack(&mut self, engine: &mut Engine, now: Millis) {
        let bytes = self.segment(self.seq, TcpFlags::ACK, &[], &[]);
        self.deliver(engine, &bytes, now);
    }

    pub fn send_data(&mut self, engine: &mut Engine, data: &[u8], now: Millis) {
        let bytes = self.segment(self.seq, TcpFlags::ACK | TcpFlags::PSH, &[], data);
        self.seq = self.seq.wrapping_add(data.len() as u32);
        self.deliver(engine, &bytes, now);
    }

    /// Send `data` at an explicit sequence number without moving `seq`.
    pub fn send_data_at(&mut self, engine: &mut Engine, seq: u32, data: &[u8], now: Millis) {
        let bytes = self.segment(seq, TcpFlags::ACK | TcpFlags::PSH, &[], data);
        self.deliver(engine, &bytes, now);
    }

    pub fn send_fin(&mut self, engine: &mut Engine, now: Millis) {
        let bytes = self.segment(self.seq, TcpFlags::FIN | TcpFlags::ACK, &[], &[]);
        self.seq = self.seq.wrapping_add(1);
        self.deliver(engine, &bytes, now);
    }

    pub fn send_rst(&mut self, engine: &mut Engine, now: Millis) {
        let bytes = self.segment(self.seq, TcpFlags::RST, &[], &[]);
        self.deliver(engine, &bytes, now);
    }

    /// Account for an engine segment: acknowledge its sequence space.
    pub fn receive(&mut self, frame: &SentFrame) {
        let seg = frame.segment();
        let end = seg.seq_number().wrapping_add(seg.seq_len());
        if seg.flags().contains(TcpFlags::SYN) || end.wrapping_sub(self.ack) as i32 > 0 {
            self.ack = end;
        }
    }
}

pub fn single(frames: Vec<SentFrame>) -> SentFrame {
    assert_eq!(frames.len(), 1, "expected exactly one frame, got {frames:?}");
    frames.into_iter().next().expect("one frame")
}

pub fn secret() -> HashSecret {
    HashSecret::from_bytes(SECRET)
}

/// Open a guest-initiated flow and complete the handshake. Returns the host socket and our ISN.
pub fn establish(engine: &mut Engine, guest: &mut Guest, now: Millis) -> (RawFd, u32) {
    guest.syn(engine, now);
    let &(_, _, fd) = engine.host().connects.last().expect("no connect issued");
    pump(engine, now);

    let syn_ack = single(engine.tap_mut().take());
    let seg = syn_ack.segment();
    assert_eq!(seg.flags(), TcpFlags::SYN | TcpFlags::ACK);
    let isn = seg.seq_number();
    guest.receive(&syn_ack);
    guest.send_ack(engine, now);
    assert!(engine.tap_mut().take().is_empty());
    (fd, isn)
}
