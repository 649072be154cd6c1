//! Listening sockets declared by the forwarding rules.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

use tracing::{info, warn};

use crate::config::TcpConfig;
use crate::epoll_ref::EpollRef;
use crate::fwd::PortFwd;
use crate::host::{AddrFamily, HostIo, Interest, RouteMirror};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    pub fd: RawFd,
    pub addr: SocketAddr,
    /// Port accepted connections are forwarded to.
    pub target_port: u16,
    /// Bound in the guest namespace.
    pub ns: bool,
}

#[derive(Debug, Default)]
pub struct Listeners {
    socks: Vec<Listener>,
}

impl Listeners {
    pub fn iter(&self) -> impl Iterator<Item = &Listener> + '_ {
        self.socks.iter()
    }

    pub fn len(&self) -> usize {
        self.socks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.socks.is_empty()
    }

    pub fn find(&self, fd: RawFd) -> Option<&Listener> {
        self.socks.iter().find(|l| l.fd == fd)
    }

    /// Bind every listener the rule sets ask for. Individual failures are logged and skipped.
    pub fn bind<H: HostIo>(
        &mut self,
        cfg: &TcpConfig,
        fwd_in: &PortFwd,
        fwd_out: &PortFwd,
        host: &mut H,
        mirror: &mut dyn RouteMirror,
    ) {
        let families = families(cfg);

        for (port, target) in fwd_in.listen_ports(&cfg.ephemeral_ports) {
            for family in &families {
                let ip = match (target.addr, family) {
                    (Some(addr), _) if AddrFamily::of(&SocketAddr::new(addr, 0)) != *family => {
                        continue
                    }
                    (Some(addr), _) => addr,
                    (None, AddrFamily::V4) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    (None, AddrFamily::V6) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                self.bind_one(host, SocketAddr::new(ip, port), target.port, false);
            }
        }

        if !cfg.splice {
            return;
        }
        let ns_ports = fwd_out.listen_ports(&cfg.ephemeral_ports);
        if ns_ports.is_empty() {
            return;
        }
        for family in &families {
            mirror_namespace(mirror, *family);
        }
        for (port, target) in ns_ports {
            for family in &families {
                let ip = match family {
                    AddrFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    AddrFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                self.bind_one(host, SocketAddr::new(ip, port), target.port, true);
            }
        }
    }

    fn bind_one<H: HostIo>(&mut self, host: &mut H, addr: SocketAddr, target_port: u16, ns: bool) {
        let fd = match host.listen(addr, ns) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(%addr, ns, error = %err, "failed to bind listener");
                return;
            }
        };
        let token = match EpollRef::listen(target_port, ns, fd).encode() {
            Ok(token) => token,
            Err(err) => {
                warn!(%addr, error = %err, "listener descriptor out of range");
                host.close(fd);
                return;
            }
        };
        if let Err(err) = host.watch(fd, token, Interest::READ) {
            warn!(%addr, error = %err, "failed to watch listener");
            host.close(fd);
            return;
        }
        info!(%addr, target_port, ns, "listening");
        self.socks.push(Listener {
            fd,
            addr,
            target_port,
            ns,
        });
    }

    pub fn close_all<H: HostIo>(&mut self, host: &mut H) {
        for listener in self.socks.drain(..) {
            host.close(listener.fd);
        }
    }
}

fn families(cfg: &TcpConfig) -> Vec<AddrFamily> {
    let mut out = Vec::with_capacity(2);
    if cfg.guest_addr4.is_some() {
        out.push(AddrFamily::V4);
    }
    if cfg.guest_addr6.is_some() {
        out.push(AddrFamily::V6);
    }
    out
}

/// Copy addresses and the default route of the external interface into the namespace.
fn mirror_namespace(mirror: &mut dyn RouteMirror, family: AddrFamily) {
    let res = mirror.lookup_interface(family, false).and_then(|src| {
        let dst = mirror.lookup_interface(family, true)?;
        mirror.duplicate_address(src, dst, family)?;
        mirror.duplicate_route(src, dst, family)
    });
    if let Err(err) = res {
        warn!(?family, error = %err, "failed to mirror routes into namespace");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_route: bool,
    }

    impl RouteMirror for Recorder {
        fn lookup_interface(&mut self, family: AddrFamily, ns: bool) -> io::Result<u32> {
            self.calls.push(format!("lookup {family:?} {ns}"));
            Ok(if ns { 2 } else { 1 })
        }

        fn duplicate_route(&mut self, src: u32, dst: u32, _family: AddrFamily) -> io::Result<()> {
            self.calls.push(format!("route {src}->{dst}"));
            if self.fail_route {
                return Err(io::ErrorKind::PermissionDenied.into());
            }
            Ok(())
        }

        fn duplicate_address(&mut self, src: u32, dst: u32, _family: AddrFamily) -> io::Result<()> {
            self.calls.push(format!("addr {src}->{dst}"));
            Ok(())
        }
    }

    #[test]
    fn mirroring_errors_are_ignored() {
        let mut rec = Recorder {
            fail_route: true,
            ..Recorder::default()
        };
        mirror_namespace(&mut rec, AddrFamily::V4);
        assert_eq!(
            rec.calls,
            vec!["lookup V4 false", "lookup V4 true", "addr 1->2", "route 1->2"]
        );
    }

    #[test]
    fn families_follow_guest_addresses() {
        let mut cfg = TcpConfig::default();
        assert_eq!(families(&cfg), vec![AddrFamily::V4]);
        cfg.guest_addr6 = Some(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2));
        assert_eq!(families(&cfg), vec![AddrFamily::V4, AddrFamily::V6]);
    }
}
