use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;

use tapbridge_tcp::packet::MacAddr;
use tapbridge_tcp::{FwdDirection, FwdParseError, PortFwd, TcpConfig};
use thiserror::Error;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tapbridge.socket";
const LOCAL_PORT_RANGE: &str = "/proc/sys/net/ipv4/ip_local_port_range";
/// Locally administered address we answer from on the tap.
pub const DEFAULT_OUR_MAC: MacAddr = MacAddr([0x9a, 0x55, 0x9a, 0x55, 0x9a, 0x55]);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// UNIX socket the hypervisor connects to for frames.
    pub socket_path: PathBuf,
    /// Guest network namespace (`/proc/<pid>/ns/net` or a bind mount). Enables splicing.
    pub netns: Option<PathBuf>,
    /// Packet capture file, or a directory to create a timestamped one in.
    pub pcap: Option<PathBuf>,
    pub our_mac: MacAddr,
    pub tcp: TcpConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingEnv(&'static str),
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid port forwarding in {var}: {source}")]
    Forwarding {
        var: &'static str,
        #[source]
        source: FwdParseError,
    },
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::from_lookup(|var| std::env::var(var).ok())?;
        if let Some(range) = fs::read_to_string(LOCAL_PORT_RANGE)
            .ok()
            .as_deref()
            .and_then(parse_port_range)
        {
            cfg.tcp.ephemeral_ports = range;
        }
        Ok(cfg)
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut tcp = TcpConfig::default();

        let socket_path = get("TAPBRIDGE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
        let netns = get("TAPBRIDGE_NETNS").map(PathBuf::from);
        let pcap = get("TAPBRIDGE_PCAP").map(PathBuf::from);
        let our_mac = match get("TAPBRIDGE_MAC") {
            Some(raw) => parse_mac(&raw).ok_or(ConfigError::InvalidEnv {
                var: "TAPBRIDGE_MAC",
                value: raw,
            })?,
            None => DEFAULT_OUR_MAC,
        };

        if let Some(addr) = parsed::<Ipv4Addr>(&get, "TAPBRIDGE_GUEST_ADDR4")? {
            tcp.guest_addr4 = Some(addr);
        }
        if let Some(addr) = parsed::<Ipv6Addr>(&get, "TAPBRIDGE_GUEST_ADDR6")? {
            tcp.guest_addr6 = Some(addr);
        }
        if let Some(addr) = parsed::<Ipv4Addr>(&get, "TAPBRIDGE_GATEWAY4")? {
            tcp.gateway_addr4 = Some(addr);
        }
        if let Some(addr) = parsed::<Ipv6Addr>(&get, "TAPBRIDGE_GATEWAY6")? {
            tcp.gateway_addr6 = Some(addr);
        }
        if let Some(mtu) = parsed::<u16>(&get, "TAPBRIDGE_MTU")? {
            tcp.mtu = mtu;
        }
        if let Some(max) = parsed::<u32>(&get, "TAPBRIDGE_MAX_CONNS")? {
            tcp.max_connections = max;
        }
        if let Some(secs) = parsed::<u64>(&get, "TAPBRIDGE_IDLE_TIMEOUT_SECS")? {
            tcp.idle_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(ms) = parsed::<u64>(&get, "TAPBRIDGE_TIME_WAIT_MS")? {
            tcp.time_wait_ms = ms;
        }
        if let Some(ms) = parsed::<u64>(&get, "TAPBRIDGE_TIMER_INTERVAL_MS")? {
            if ms == 0 {
                return Err(ConfigError::InvalidEnv {
                    var: "TAPBRIDGE_TIMER_INTERVAL_MS",
                    value: ms.to_string(),
                });
            }
            tcp.timer_interval_ms = ms;
        }

        if let Some(ms) = parsed::<u64>(&get, "TAPBRIDGE_RTO_INITIAL_MS")? {
            if ms == 0 {
                return Err(ConfigError::InvalidEnv {
                    var: "TAPBRIDGE_RTO_INITIAL_MS",
                    value: ms.to_string(),
                });
            }
            tcp.rto_initial_ms = ms;
        }
        if let Some(ms) = parsed::<u64>(&get, "TAPBRIDGE_RTO_MAX_MS")? {
            tcp.rto_max_ms = ms;
        }
        if tcp.rto_max_ms < tcp.rto_initial_ms {
            return Err(ConfigError::InvalidEnv {
                var: "TAPBRIDGE_RTO_MAX_MS",
                value: tcp.rto_max_ms.to_string(),
            });
        }
        if let Some(retries) = parsed::<u8>(&get, "TAPBRIDGE_MAX_RETRIES")? {
            tcp.max_retries = retries;
        }
        if let Some(ms) = parsed::<u64>(&get, "TAPBRIDGE_HANDSHAKE_TIMEOUT_MS")? {
            tcp.handshake_timeout_ms = ms;
        }
        if let Some(ms) = parsed::<u64>(&get, "TAPBRIDGE_FIN_TIMEOUT_MS")? {
            tcp.fin_timeout_ms = ms;
        }

        if let Some(spec) = get("TAPBRIDGE_TCP_PORTS") {
            tcp.fwd_in = forwarding(FwdDirection::Inbound, "TAPBRIDGE_TCP_PORTS", &spec)?;
        }
        if let Some(spec) = get("TAPBRIDGE_TCP_NS_PORTS") {
            tcp.fwd_out = forwarding(FwdDirection::Outbound, "TAPBRIDGE_TCP_NS_PORTS", &spec)?;
        }

        tcp.splice = match get("TAPBRIDGE_SPLICE").as_deref().map(str::trim) {
            None => netns.is_some(),
            Some("1" | "true" | "yes") => true,
            Some("0" | "false" | "no") => false,
            Some(other) => {
                return Err(ConfigError::InvalidEnv {
                    var: "TAPBRIDGE_SPLICE",
                    value: other.to_string(),
                })
            }
        };
        if tcp.splice && netns.is_none() {
            return Err(ConfigError::MissingEnv("TAPBRIDGE_NETNS"));
        }

        Ok(Self {
            socket_path,
            netns,
            pcap,
            our_mac,
            tcp,
        })
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = get(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv { var, value: raw })
}

fn forwarding(dir: FwdDirection, var: &'static str, spec: &str) -> Result<PortFwd, ConfigError> {
    PortFwd::parse(dir, spec).map_err(|source| ConfigError::Forwarding { var, source })
}

/// `ip_local_port_range` contents: two whitespace-separated ports.
fn parse_port_range(raw: &str) -> Option<RangeInclusive<u16>> {
    let mut words = raw.split_whitespace();
    let first = words.next()?.parse().ok()?;
    let last = words.next()?.parse().ok()?;
    (first <= last).then_some(first..=last)
}

fn parse_mac(raw: &str) -> Option<MacAddr> {
    let mut mac = [0u8; 6];
    let mut parts = raw.trim().split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(MacAddr(mac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tapbridge_tcp::FwdMode;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert!(cfg.netns.is_none());
        assert!(!cfg.tcp.splice);
        assert_eq!(cfg.tcp.fwd_in.mode(), FwdMode::None);
        assert_eq!(cfg.tcp.fwd_out.mode(), FwdMode::All);
        assert_eq!(cfg.our_mac, DEFAULT_OUR_MAC);
    }

    #[test]
    fn netns_enables_splicing() {
        let cfg = BridgeConfig::from_lookup(lookup(&[
            ("TAPBRIDGE_NETNS", "/run/netns/guest"),
            ("TAPBRIDGE_TCP_PORTS", "22,8080:80"),
            ("TAPBRIDGE_IDLE_TIMEOUT_SECS", "30"),
            ("TAPBRIDGE_MAC", "02:00:00:00:00:01"),
        ]))
        .unwrap();
        assert!(cfg.tcp.splice);
        assert_eq!(cfg.tcp.fwd_in.lookup(8080).unwrap().port, 80);
        assert_eq!(cfg.tcp.idle_timeout_ms, 30_000);
        assert_eq!(cfg.our_mac, MacAddr([2, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn retransmission_schedule_is_configurable() {
        let cfg = BridgeConfig::from_lookup(lookup(&[
            ("TAPBRIDGE_RTO_INITIAL_MS", "200"),
            ("TAPBRIDGE_RTO_MAX_MS", "5000"),
            ("TAPBRIDGE_MAX_RETRIES", "8"),
            ("TAPBRIDGE_HANDSHAKE_TIMEOUT_MS", "3000"),
            ("TAPBRIDGE_FIN_TIMEOUT_MS", "20000"),
        ]))
        .unwrap();
        assert_eq!(cfg.tcp.rto_initial_ms, 200);
        assert_eq!(cfg.tcp.rto_max_ms, 5000);
        assert_eq!(cfg.tcp.max_retries, 8);
        assert_eq!(cfg.tcp.handshake_timeout_ms, 3000);
        assert_eq!(cfg.tcp.fin_timeout_ms, 20_000);

        let err = BridgeConfig::from_lookup(lookup(&[("TAPBRIDGE_RTO_MAX_MS", "10")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "TAPBRIDGE_RTO_MAX_MS", .. }));
        let err =
            BridgeConfig::from_lookup(lookup(&[("TAPBRIDGE_RTO_INITIAL_MS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "TAPBRIDGE_RTO_INITIAL_MS", .. }));
        assert!(BridgeConfig::from_lookup(lookup(&[("TAPBRIDGE_MAX_RETRIES", "300")])).is_err());
    }

    #[test]
    fn parses_local_port_range() {
        assert_eq!(parse_port_range("32768\t60999\n"), Some(32768..=60999));
        assert_eq!(parse_port_range("1024 1023"), None);
        assert_eq!(parse_port_range("garbage"), None);
    }

    #[test]
    fn splicing_needs_a_namespace() {
        let err = BridgeConfig::from_lookup(lookup(&[("TAPBRIDGE_SPLICE", "yes")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("TAPBRIDGE_NETNS")));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = BridgeConfig::from_lookup(lookup(&[("TAPBRIDGE_MTU", "jumbo")])).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidEnv { var: "TAPBRIDGE_MTU", ref value } if value == "jumbo")
        );

        let err =
            BridgeConfig::from_lookup(lookup(&[("TAPBRIDGE_TCP_PORTS", "none,22")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Forwarding {
                var: "TAPBRIDGE_TCP_PORTS",
                source: FwdParseError::NoneCombined
            }
        ));

        assert!(BridgeConfig::from_lookup(lookup(&[("TAPBRIDGE_MAC", "02:00:00:00:00")])).is_err());
    }
}
