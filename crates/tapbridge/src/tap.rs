//! The hypervisor side of the tap: Ethernet frames over a stream-oriented UNIX socket, each
//! preceded by its length as a 32-bit big-endian integer (qemu's `-netdev stream` framing).

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use tapbridge_tcp::packet::{
    build_ethernet, build_ipv4, build_ipv6, EthernetFrame, MacAddr, ETHERTYPE_IPV4, ETHERTYPE_IPV6,
};
use tapbridge_tcp::{Capture, TapFrame, TapIo};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Largest frame accepted from the hypervisor.
pub const MAX_FRAME_LEN: usize = 65535 + EthernetFrame::HEADER_LEN;
/// Frames queued towards the hypervisor beyond this are dropped.
pub const MAX_PENDING_OUT: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("tap I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("bad frame length {0}")]
    BadLength(usize),
    #[error("hypervisor disconnected")]
    Disconnected,
}

/// Splits the byte stream from the hypervisor into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TapError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(TapError::BadLength(len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(frame))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

pub fn encode_frame(out: &mut VecDeque<u8>, frame: &[u8]) {
    out.extend((frame.len() as u32).to_be_bytes());
    out.extend(frame);
}

pub struct QemuTap {
    listener: Option<UnixListener>,
    stream: Option<UnixStream>,
    decoder: FrameDecoder,
    out: VecDeque<u8>,
    our_mac: MacAddr,
    /// Learned from the first frame the guest sends.
    guest_mac: MacAddr,
    ip_id: u16,
    capture: Option<Box<dyn Capture>>,
    dropped: u64,
}

impl std::fmt::Debug for QemuTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QemuTap")
            .field("connected", &self.stream.is_some())
            .field("pending", &self.out.len())
            .field("guest_mac", &self.guest_mac)
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

impl QemuTap {
    /// Listen for the hypervisor on `path`, replacing a stale socket file.
    pub fn bind(path: &Path, our_mac: MacAddr) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!(path = %path.display(), "waiting for hypervisor connection");
        Ok(Self::new(Some(listener), None, our_mac))
    }

    /// A tap over an already connected stream.
    pub fn from_stream(stream: UnixStream, our_mac: MacAddr) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(None, Some(stream), our_mac))
    }

    fn new(listener: Option<UnixListener>, stream: Option<UnixStream>, our_mac: MacAddr) -> Self {
        Self {
            listener,
            stream,
            decoder: FrameDecoder::default(),
            out: VecDeque::new(),
            our_mac,
            guest_mac: MacAddr::BROADCAST,
            ip_id: 0,
            capture: None,
            dropped: 0,
        }
    }

    pub fn set_capture(&mut self, capture: Box<dyn Capture>) {
        self.capture = Some(capture);
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Descriptor to watch: the connection when there is one, the listener otherwise.
    pub fn fd(&self) -> Option<RawFd> {
        match (&self.stream, &self.listener) {
            (Some(stream), _) => Some(stream.as_raw_fd()),
            (None, Some(listener)) => Some(listener.as_raw_fd()),
            (None, None) => None,
        }
    }

    pub fn guest_mac(&self) -> MacAddr {
        self.guest_mac
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn has_pending(&self) -> bool {
        !self.out.is_empty()
    }

    /// Take a pending hypervisor connection. Returns whether one was accepted.
    pub fn accept(&mut self) -> io::Result<bool> {
        let Some(listener) = &self.listener else {
            return Ok(false);
        };
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                info!("hypervisor connected");
                self.stream = Some(stream);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Drop the current connection and everything queued for it.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!("hypervisor disconnected");
        }
        self.decoder.clear();
        self.out.clear();
    }

    /// Read everything available and return the complete frames.
    pub fn receive(&mut self) -> Result<Vec<Vec<u8>>, TapError> {
        let Some(stream) = &mut self.stream else {
            return Ok(Vec::new());
        };
        let mut buf = [0u8; 64 * 1024];
        let mut eof = false;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => self.decoder.push(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.next_frame()? {
            if let Ok(eth) = EthernetFrame::parse(&frame) {
                let src = eth.src_mac();
                if src != self.guest_mac && src != MacAddr::BROADCAST {
                    debug!(mac = ?src.0, "guest MAC address");
                    self.guest_mac = src;
                }
            }
            self.capture_frame(&frame);
            frames.push(frame);
        }
        if eof && frames.is_empty() {
            return Err(TapError::Disconnected);
        }
        Ok(frames)
    }

    /// Write as much of the output queue as the socket takes.
    pub fn flush(&mut self) -> io::Result<()> {
        let Some(stream) = &mut self.stream else {
            self.out.clear();
            return Ok(());
        };
        while !self.out.is_empty() {
            let (front, _) = self.out.as_slices();
            match stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.out.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn capture_frame(&mut self, frame: &[u8]) {
        if let Some(capture) = &mut self.capture {
            // Capture failures are the writer's business.
            let _ = capture.record(frame);
        }
    }

    /// Wrap a transport payload in IP and Ethernet headers.
    pub fn build(&mut self, frame: TapFrame<'_>) -> Option<Vec<u8>> {
        let (ethertype, packet) = match (frame.src, frame.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                self.ip_id = self.ip_id.wrapping_add(1);
                let ip = build_ipv4(src, dst, frame.protocol, self.ip_id, frame.payload);
                (ETHERTYPE_IPV4, ip)
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let ip = build_ipv6(src, dst, frame.protocol, frame.flow, frame.payload);
                (ETHERTYPE_IPV6, ip)
            }
            _ => return None,
        };
        Some(build_ethernet(self.guest_mac, self.our_mac, ethertype, &packet))
    }
}

impl TapIo for QemuTap {
    fn send_frame(&mut self, frame: TapFrame<'_>) {
        if self.stream.is_none() {
            trace!("no hypervisor connected, dropping frame");
            self.dropped += 1;
            return;
        }
        let Some(bytes) = self.build(frame) else {
            warn!(src = %frame.src, dst = %frame.dst, "address family mismatch, dropping frame");
            self.dropped += 1;
            return;
        };
        if self.out.len() + bytes.len() + LEN_PREFIX > MAX_PENDING_OUT {
            trace!(pending = self.out.len(), "tap output queue full, dropping frame");
            self.dropped += 1;
            return;
        }
        self.capture_frame(&bytes);
        encode_frame(&mut self.out, &bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tapbridge_tcp::packet::IpPacket;

    const OUR_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);

    #[test]
    fn decoder_reassembles_split_frames() {
        let mut out = VecDeque::new();
        encode_frame(&mut out, &[1; 20]);
        encode_frame(&mut out, &[2; 30]);
        let bytes: Vec<u8> = out.into_iter().collect();

        let mut dec = FrameDecoder::default();
        dec.push(&bytes[..10]);
        assert!(dec.next_frame().unwrap().is_none());
        dec.push(&bytes[10..]);
        assert_eq!(dec.next_frame().unwrap().unwrap(), vec![1; 20]);
        assert_eq!(dec.next_frame().unwrap().unwrap(), vec![2; 30]);
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn decoder_rejects_absurd_lengths() {
        let mut dec = FrameDecoder::default();
        dec.push(&0u32.to_be_bytes());
        assert!(matches!(dec.next_frame(), Err(TapError::BadLength(0))));

        let mut dec = FrameDecoder::default();
        dec.push(&(1u32 << 20).to_be_bytes());
        assert!(matches!(dec.next_frame(), Err(TapError::BadLength(_))));
    }

    #[test]
    fn frames_travel_both_ways_and_learn_the_guest_mac() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut tap = QemuTap::from_stream(ours, OUR_MAC).unwrap();

        let guest_mac = MacAddr([2, 0, 0, 0, 0, 0x15]);
        let eth = build_ethernet(OUR_MAC, guest_mac, ETHERTYPE_IPV4, &[0u8; 20]);
        let mut wire = VecDeque::new();
        encode_frame(&mut wire, &eth);
        theirs.write_all(wire.make_contiguous()).unwrap();

        let frames = tap.receive().unwrap();
        assert_eq!(frames, vec![eth]);
        assert_eq!(tap.guest_mac(), guest_mac);

        tap.send_frame(TapFrame {
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 2, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)),
            protocol: 6,
            payload: b"segment",
            flow: 0,
        });
        assert!(tap.has_pending());
        tap.flush().unwrap();
        assert!(!tap.has_pending());

        let mut len = [0u8; 4];
        theirs.read_exact(&mut len).unwrap();
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        theirs.read_exact(&mut frame).unwrap();
        let eth = EthernetFrame::parse(&frame).unwrap();
        assert_eq!(eth.dest_mac(), guest_mac);
        assert_eq!(eth.src_mac(), OUR_MAC);
        let ip = IpPacket::parse(eth.ethertype(), eth.payload()).unwrap();
        assert_eq!(ip.payload, b"segment");
    }

    #[test]
    fn peer_close_is_reported() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut tap = QemuTap::from_stream(ours, OUR_MAC).unwrap();
        drop(theirs);
        assert!(matches!(tap.receive(), Err(TapError::Disconnected)));
    }

    #[test]
    fn frames_without_a_hypervisor_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut tap = QemuTap::bind(&dir.path().join("tap.sock"), OUR_MAC).unwrap();
        assert!(!tap.is_connected());
        tap.send_frame(TapFrame {
            src: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dst: IpAddr::V4(Ipv4Addr::LOCALHOST),
            protocol: 6,
            payload: b"x",
            flow: 0,
        });
        assert_eq!(tap.dropped(), 1);
        assert!(!tap.has_pending());
        assert!(!tap.accept().unwrap());
    }
}
