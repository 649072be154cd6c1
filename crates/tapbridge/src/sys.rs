//! [`HostIo`] on Linux: non-blocking sockets, pipes and `splice(2)`, registered with one epoll
//! instance.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::fcntl::{fcntl, splice, FcntlArg, OFlag, SpliceFFlags};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::socket::{
    accept4, bind, connect, getpeername, getsockopt, listen, recv, send, setsockopt, shutdown,
    socket, sockopt, AddressFamily, MsgFlags, Shutdown, SockFlag, SockProtocol, SockType,
    SockaddrStorage,
};
use nix::unistd::{close, pipe2};
use tapbridge_tcp::{Events, HostIo, Interest, Pipe, SockWindow};
use tracing::{debug, trace};

use crate::netns::{in_namespace, Namespaces};

const LISTEN_BACKLOG: usize = 128;
/// Buffer size requested for sockets while the connection count is low.
const LARGE_BUF: usize = 4 * 1024 * 1024;
/// `SIOCOUTQNSD`: bytes not yet sent.
const SIOCOUTQNSD: libc::c_ulong = 0x894b;
/// Offset of `tcpi_snd_wnd` in `struct tcp_info`; kernels that report it return at least
/// this many bytes plus four.
const TCPI_SND_WND_OFFSET: usize = 228;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Borrow a descriptor the engine owns.
fn borrow<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // SAFETY: engine descriptors stay open until the engine asks for them to be closed.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn socket_addr(addr: &SockaddrStorage) -> io::Result<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        return Ok(SocketAddrV4::from(*sin).into());
    }
    if let Some(sin6) = addr.as_sockaddr_in6() {
        return Ok(SocketAddrV6::from(*sin6).into());
    }
    Err(io::ErrorKind::InvalidData.into())
}

/// Raw `struct tcp_info` bytes and how many of them the kernel filled in.
fn tcp_info(fd: RawFd) -> io::Result<([u8; 256], usize)> {
    let mut buf = [0u8; 256];
    let mut len = buf.len() as libc::socklen_t;
    // SAFETY: `buf` is valid for `len` bytes.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok((buf, len as usize))
}

fn ioctl_int(fd: RawFd, request: libc::c_ulong) -> io::Result<u32> {
    let mut value: libc::c_int = 0;
    // SAFETY: both requests write a single int.
    cvt(unsafe { libc::ioctl(fd, request as _, &mut value) })?;
    Ok(value.max(0) as u32)
}

fn close_fd(fd: RawFd) {
    if let Err(err) = close(fd) {
        trace!(fd, error = %err, "close failed");
    }
}

/// Translate engine interest into epoll flags.
pub fn epoll_flags(interest: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.contains(Interest::READ) {
        flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
    }
    if interest.contains(Interest::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

/// Translate epoll readiness into engine events.
pub fn events(flags: EpollFlags) -> Events {
    let mut events = Events::empty();
    for (flag, event) in [
        (EpollFlags::EPOLLIN, Events::IN),
        (EpollFlags::EPOLLOUT, Events::OUT),
        (EpollFlags::EPOLLHUP, Events::HUP),
        (EpollFlags::EPOLLRDHUP, Events::RDHUP),
        (EpollFlags::EPOLLERR, Events::ERR),
    ] {
        if flags.contains(flag) {
            events |= event;
        }
    }
    events
}

pub struct LinuxHost {
    epoll: Epoll,
    namespaces: Option<Rc<Namespaces>>,
}

impl LinuxHost {
    pub fn new(namespaces: Option<Rc<Namespaces>>) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll, namespaces })
    }

    /// Wait for readiness; `timeout_ms` of -1 blocks indefinitely.
    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: isize) -> io::Result<usize> {
        match self.epoll.wait(events, timeout_ms) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn socket(&self, addr: &SocketAddr, ns: bool) -> io::Result<OwnedFd> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        in_namespace(self.namespaces.as_deref(), ns, || {
            Ok(socket(
                family,
                SockType::Stream,
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                SockProtocol::Tcp,
            )?)
        })
    }
}

impl HostIo for LinuxHost {
    fn connect(&mut self, dst: SocketAddr, ns: bool) -> io::Result<(RawFd, bool)> {
        let sock = self.socket(&dst, ns)?;
        match connect(sock.as_raw_fd(), &SockaddrStorage::from(dst)) {
            Ok(()) => Ok((sock.into_raw_fd(), true)),
            Err(Errno::EINPROGRESS) => Ok((sock.into_raw_fd(), false)),
            Err(err) => Err(err.into()),
        }
    }

    fn take_error(&mut self, fd: RawFd) -> io::Result<Option<io::Error>> {
        let err = getsockopt(&borrow(fd), sockopt::SocketError)?;
        Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
    }

    fn listen(&mut self, addr: SocketAddr, ns: bool) -> io::Result<RawFd> {
        let sock = self.socket(&addr, ns)?;
        setsockopt(&sock, sockopt::ReuseAddr, &true)?;
        if addr.is_ipv6() {
            setsockopt(&sock, sockopt::Ipv6V6Only, &true)?;
        }
        bind(sock.as_raw_fd(), &SockaddrStorage::from(addr))?;
        listen(&sock, LISTEN_BACKLOG)?;
        Ok(sock.into_raw_fd())
    }

    fn accept(&mut self, fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
        let sock = match accept4(fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(sock) => sock,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        // SAFETY: accept4 just handed us this descriptor.
        let sock = unsafe { OwnedFd::from_raw_fd(sock) };
        let peer = socket_addr(&getpeername::<SockaddrStorage>(sock.as_raw_fd())?)?;
        Ok(Some((sock.into_raw_fd(), peer)))
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        Ok(recv(fd, buf, MsgFlags::MSG_DONTWAIT)?)
    }

    fn send(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize> {
        Ok(send(fd, data, MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL)?)
    }

    fn shutdown_write(&mut self, fd: RawFd) -> io::Result<()> {
        Ok(shutdown(fd, Shutdown::Write)?)
    }

    fn close(&mut self, fd: RawFd) {
        trace!(fd, "close");
        close_fd(fd);
    }

    fn reset(&mut self, fd: RawFd) {
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        if let Err(err) = setsockopt(&borrow(fd), sockopt::Linger, &linger) {
            debug!(fd, error = %err, "SO_LINGER failed");
        }
        close_fd(fd);
    }

    fn window(&mut self, fd: RawFd) -> io::Result<SockWindow> {
        let (info, len) = tcp_info(fd)?;
        let snd_wnd = (len >= TCPI_SND_WND_OFFSET + 4).then(|| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&info[TCPI_SND_WND_OFFSET..TCPI_SND_WND_OFFSET + 4]);
            u32::from_ne_bytes(raw)
        });
        let sndbuf = getsockopt(&borrow(fd), sockopt::SndBuf)?;
        Ok(SockWindow {
            snd_wnd,
            unsent: ioctl_int(fd, SIOCOUTQNSD)?,
            queued: ioctl_int(fd, libc::TIOCOUTQ as libc::c_ulong)?,
            sndbuf: u32::try_from(sndbuf).unwrap_or(u32::MAX),
        })
    }

    fn set_bufsize(&mut self, fd: RawFd, large: bool) {
        if !large {
            return;
        }
        let sock = borrow(fd);
        if let Err(err) = setsockopt(&sock, sockopt::SndBuf, &LARGE_BUF)
            .and_then(|()| setsockopt(&sock, sockopt::RcvBuf, &LARGE_BUF))
        {
            trace!(fd, error = %err, "buffer size not applied");
        }
    }

    fn pipe(&mut self, size: usize) -> io::Result<Pipe> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        let size = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
        let granted = fcntl(write.as_raw_fd(), FcntlArg::F_SETPIPE_SZ(size))?;
        if granted < size {
            return Err(io::ErrorKind::OutOfMemory.into());
        }
        Ok(Pipe {
            read: read.into_raw_fd(),
            write: write.into_raw_fd(),
        })
    }

    fn splice(&mut self, from: RawFd, to: RawFd, len: usize, more: bool) -> io::Result<usize> {
        let mut flags = SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK;
        if more {
            flags |= SpliceFFlags::SPLICE_F_MORE;
        }
        Ok(splice(from, None, to, None, len, flags)?)
    }

    fn probe_snd_wnd(&mut self) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let Ok(sock) = self.socket(&addr, false) else {
            return false;
        };
        matches!(tcp_info(sock.as_raw_fd()), Ok((_, len)) if len >= TCPI_SND_WND_OFFSET + 4)
    }

    fn watch(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.epoll
            .add(borrow(fd), EpollEvent::new(epoll_flags(interest), token))?;
        Ok(())
    }

    fn rewatch(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = EpollEvent::new(epoll_flags(interest), token);
        self.epoll.modify(borrow(fd), &mut event)?;
        Ok(())
    }

    fn unwatch(&mut self, fd: RawFd) {
        if let Err(err) = self.epoll.delete(borrow(fd)) {
            trace!(fd, error = %err, "epoll delete failed");
        }
    }
}
