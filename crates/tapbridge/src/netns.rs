//! The guest network namespace: entering it for namespace-side sockets, and mirroring the host's
//! external addresses and default route into it.

use std::ffi::CStr;
use std::fs::{self, File};
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::process::Command;
use std::rc::Rc;

use nix::sched::{setns, CloneFlags};
use tapbridge_tcp::{AddrFamily, RouteMirror};
use tracing::{debug, error};

/// Handles on the init and guest network namespaces.
#[derive(Debug)]
pub struct Namespaces {
    init: File,
    guest: File,
}

impl Namespaces {
    pub fn open(guest: &Path) -> io::Result<Self> {
        Ok(Self {
            init: File::open("/proc/thread-self/ns/net")?,
            guest: File::open(guest)?,
        })
    }

    /// Switch the calling thread into the guest namespace until the guard drops.
    pub fn enter_guest(&self) -> io::Result<NsGuard<'_>> {
        setns(&self.guest, CloneFlags::CLONE_NEWNET)?;
        Ok(NsGuard { init: &self.init })
    }
}

pub struct NsGuard<'a> {
    init: &'a File,
}

impl Drop for NsGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = setns(self.init, CloneFlags::CLONE_NEWNET) {
            // Everything after this would run in the wrong namespace.
            error!(error = %err, "failed to return to the init namespace");
            std::process::abort();
        }
    }
}

/// Run `f` in the guest namespace when `ns` is set, in the current one otherwise.
pub fn in_namespace<R>(
    namespaces: Option<&Namespaces>,
    ns: bool,
    f: impl FnOnce() -> io::Result<R>,
) -> io::Result<R> {
    if !ns {
        return f();
    }
    let namespaces = namespaces.ok_or(io::ErrorKind::Unsupported)?;
    let _guard = namespaces.enter_guest()?;
    f()
}

/// Interface carrying the IPv4 default route, from `/proc/net/route`.
pub fn default_route_v4(table: &str) -> Option<&str> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (iface, dest, mask) = (fields.first()?, fields.get(1)?, fields.get(7)?);
        (*dest == "00000000" && *mask == "00000000" && *iface != "lo").then_some(*iface)
    })
}

/// Interface carrying the IPv6 default route, from `/proc/net/ipv6_route`.
pub fn default_route_v6(table: &str) -> Option<&str> {
    const RTF_REJECT: u32 = 0x0200;
    table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }
        let flags = u32::from_str_radix(fields[8], 16).ok()?;
        let default = fields[0].bytes().all(|b| b == b'0') && fields[1] == "00";
        (default && flags & RTF_REJECT == 0 && fields[9] != "lo").then_some(fields[9])
    })
}

/// Global-scope addresses from `ip -o addr show` output, as `addr/prefix`.
pub fn parse_addresses(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("scope global"))
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "inet" || *w == "inet6")?;
            let cidr = words.next()?;
            let (addr, _) = cidr.split_once('/')?;
            addr.parse::<IpAddr>().ok()?;
            Some(cidr.to_string())
        })
        .collect()
}

/// Gateway of the default route in `ip -o route show` output.
pub fn parse_default_gateway(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        if words.next()? != "default" {
            return None;
        }
        words.find(|w| *w == "via")?;
        words.next()?.parse().ok()
    })
}

fn family_flag(family: AddrFamily) -> &'static str {
    match family {
        AddrFamily::V4 => "-4",
        AddrFamily::V6 => "-6",
    }
}

fn if_name(index: u32) -> io::Result<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: `buf` is IF_NAMESIZE bytes, as if_indextoname requires.
    let name = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if name.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: on success the buffer holds a NUL-terminated name.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

fn ip(args: &[&str]) -> io::Result<String> {
    let out = Command::new("ip").args(args).output()?;
    if !out.status.success() {
        let msg = String::from_utf8_lossy(&out.stderr).trim().to_string();
        return Err(io::Error::new(io::ErrorKind::Other, format!("ip {}: {msg}", args.join(" "))));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// [`RouteMirror`] backed by procfs and iproute2. Commands for the guest side are spawned from
/// inside the guest namespace, so they act on it.
#[derive(Debug)]
pub struct NetnsMirror {
    namespaces: Rc<Namespaces>,
}

impl NetnsMirror {
    pub fn new(namespaces: Rc<Namespaces>) -> Self {
        Self { namespaces }
    }

    fn run<R>(&self, ns: bool, f: impl FnOnce() -> io::Result<R>) -> io::Result<R> {
        in_namespace(Some(&self.namespaces), ns, f)
    }
}

impl RouteMirror for NetnsMirror {
    fn lookup_interface(&mut self, family: AddrFamily, ns: bool) -> io::Result<u32> {
        self.run(ns, || {
            let (path, pick): (&str, fn(&str) -> Option<&str>) = match family {
                AddrFamily::V4 => ("/proc/thread-self/net/route", default_route_v4),
                AddrFamily::V6 => ("/proc/thread-self/net/ipv6_route", default_route_v6),
            };
            let table = fs::read_to_string(path)?;
            let name = pick(&table).ok_or(io::ErrorKind::NotFound)?;
            let index = nix::net::if_::if_nametoindex(name)?;
            debug!(?family, ns, name, index, "default route interface");
            Ok(index)
        })
    }

    fn duplicate_route(&mut self, src: u32, dst: u32, family: AddrFamily) -> io::Result<()> {
        let src_name = if_name(src)?;
        let routes = ip(&[family_flag(family), "-o", "route", "show", "dev", &src_name])?;
        let Some(gateway) = parse_default_gateway(&routes) else {
            return Ok(());
        };
        let gateway = gateway.to_string();
        self.run(true, || {
            let dst_name = if_name(dst)?;
            ip(&[family_flag(family), "route", "replace", "default", "via", &gateway, "dev", &dst_name])
                .map(drop)
        })
    }

    fn duplicate_address(&mut self, src: u32, dst: u32, family: AddrFamily) -> io::Result<()> {
        let src_name = if_name(src)?;
        let listing = ip(&[family_flag(family), "-o", "addr", "show", "dev", &src_name])?;
        let addrs = parse_addresses(&listing);
        self.run(true, || {
            let dst_name = if_name(dst)?;
            for addr in &addrs {
                ip(&["addr", "replace", addr, "dev", &dst_name])?;
            }
            Ok(())
        })
    }
}
