//! Port forwarding rule sets.
//!
//! Two rule sets exist per process: inbound (host ports exposed to the guest) and outbound
//! (guest-bound ports forwarded outwards). Both are read-only once the engine is running.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FwdDirection {
    /// Host-side listeners whose connections are handed to the guest.
    Inbound,
    /// Guest-initiated connections forwarded to host endpoints.
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwdMode {
    /// Nothing is forwarded.
    None,
    /// Only ports listed explicitly are forwarded.
    Spec,
    /// Every port is forwarded unchanged, except explicit exclusions and remappings.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FwdTarget {
    /// Port the connection is forwarded *to*.
    pub port: u16,
    /// Bind address for listeners (inbound) or target address override (outbound).
    pub addr: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FwdParseError {
    #[error("empty port forwarding specification")]
    Empty,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("invalid port range {0:?}")]
    InvalidRange(String),
    #[error("source and target ranges differ in length in {0:?}")]
    RangeMismatch(String),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("\"none\" cannot be combined with other entries")]
    NoneCombined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFwd {
    direction: FwdDirection,
    mode: FwdMode,
    ports: BTreeMap<u16, FwdTarget>,
    excluded: BTreeSet<u16>,
    /// Set by an explicit `all` entry: every permitted port gets a listener, not only the
    /// listed ones.
    listen_all: bool,
}

impl PortFwd {
    pub fn none(direction: FwdDirection) -> Self {
        Self {
            direction,
            mode: FwdMode::None,
            ports: BTreeMap::new(),
            excluded: BTreeSet::new(),
            listen_all: false,
        }
    }

    /// Permit every port without opening listeners for them.
    pub fn all(direction: FwdDirection) -> Self {
        Self {
            mode: FwdMode::All,
            ..Self::none(direction)
        }
    }

    /// Parse a comma-separated forwarding specification.
    ///
    /// Accepted entries: `all`, `none`, `N`, `N-M`, `N:T`, `N-M:T-U`, any of these prefixed by
    /// `ADDR/`, and `~N` / `~N-M` exclusions.
    pub fn parse(direction: FwdDirection, spec: &str) -> Result<Self, FwdParseError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(FwdParseError::Empty);
        }

        let mut fwd = Self::none(direction);
        let mut saw_none = false;
        let mut saw_other = false;

        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item {
                "none" => saw_none = true,
                "all" => {
                    saw_other = true;
                    fwd.mode = FwdMode::All;
                    fwd.listen_all = true;
                }
                _ => {
                    saw_other = true;
                    fwd.parse_item(item)?;
                }
            }
        }

        if saw_none {
            if saw_other {
                return Err(FwdParseError::NoneCombined);
            }
            return Ok(Self::none(direction));
        }
        if !saw_other {
            return Err(FwdParseError::Empty);
        }
        Ok(fwd)
    }

    fn parse_item(&mut self, item: &str) -> Result<(), FwdParseError> {
        if let Some(excl) = item.strip_prefix('~') {
            let (first, last) = parse_range(excl)?;
            for port in first..=last {
                self.exclude(port);
            }
            return Ok(());
        }

        let (addr, ports) = match item.rsplit_once('/') {
            Some((addr, ports)) => {
                let addr = IpAddr::from_str(addr.trim_matches(|c| c == '[' || c == ']'))
                    .map_err(|_| FwdParseError::InvalidAddress(addr.to_string()))?;
                (Some(addr), ports)
            }
            None => (None, item),
        };

        let (src, dst) = match ports.split_once(':') {
            Some((src, dst)) => (parse_range(src)?, Some(parse_range(dst)?)),
            None => (parse_range(ports)?, None),
        };

        let (first, last) = src;
        let (target_first, target_last) = dst.unwrap_or(src);
        if last - first != target_last - target_first {
            return Err(FwdParseError::RangeMismatch(item.to_string()));
        }

        if self.mode == FwdMode::None {
            self.mode = FwdMode::Spec;
        }
        for (i, port) in (first..=last).enumerate() {
            if self.excluded.contains(&port) {
                continue;
            }
            let target = target_first + i as u16;
            self.add(port, FwdTarget { port: target, addr });
        }
        Ok(())
    }

    pub fn add(&mut self, port: u16, target: FwdTarget) {
        if self.mode == FwdMode::None {
            self.mode = FwdMode::Spec;
        }
        self.excluded.remove(&port);
        self.ports.insert(port, target);
    }

    pub fn exclude(&mut self, port: u16) {
        self.ports.remove(&port);
        self.excluded.insert(port);
    }

    pub fn direction(&self) -> FwdDirection {
        self.direction
    }

    pub fn mode(&self) -> FwdMode {
        self.mode
    }

    /// Namespace listeners for this direction bind in: `false` for the init namespace.
    pub fn ns(&self) -> bool {
        self.direction == FwdDirection::Outbound
    }

    /// Map a port seen on the wire to its forwarding target, or `None` if the flow is denied.
    pub fn lookup(&self, port: u16) -> Option<FwdTarget> {
        if self.excluded.contains(&port) {
            return None;
        }
        match self.mode {
            FwdMode::None => None,
            FwdMode::Spec => self.ports.get(&port).copied(),
            FwdMode::All => Some(
                self.ports
                    .get(&port)
                    .copied()
                    .unwrap_or(FwdTarget { port, addr: None }),
            ),
        }
    }

    /// Explicitly listed ports, in ascending order.
    pub fn entries(&self) -> impl Iterator<Item = (u16, FwdTarget)> + '_ {
        self.ports.iter().map(|(port, target)| (*port, *target))
    }

    /// Ports that get a listener, with their targets, in ascending order.
    ///
    /// After an explicit `all` this is every port that is not excluded, leaving out `ephemeral`
    /// unless a port there is listed explicitly: binding those would take ports away from the
    /// host's own outgoing connections.
    pub fn listen_ports(&self, ephemeral: &RangeInclusive<u16>) -> Vec<(u16, FwdTarget)> {
        if !(self.listen_all && self.mode == FwdMode::All) {
            return self.entries().collect();
        }
        (1..=u16::MAX)
            .filter(|port| !self.excluded.contains(port))
            .filter_map(|port| match self.ports.get(&port) {
                Some(target) => Some((port, *target)),
                None if ephemeral.contains(&port) => None,
                None => Some((port, FwdTarget { port, addr: None })),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mode == FwdMode::None
    }
}

fn parse_port(s: &str) -> Result<u16, FwdParseError> {
    let s = s.trim();
    s.parse::<u16>()
        .map_err(|_| FwdParseError::InvalidPort(s.to_string()))
}

fn parse_range(s: &str) -> Result<(u16, u16), FwdParseError> {
    match s.split_once('-') {
        Some((first, last)) => {
            let first = parse_port(first)?;
            let last = parse_port(last)?;
            if last < first {
                return Err(FwdParseError::InvalidRange(s.to_string()));
            }
            Ok((first, last))
        }
        None => {
            let port = parse_port(s)?;
            Ok((port, port))
        }
    }
}
