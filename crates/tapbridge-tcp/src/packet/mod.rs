//! Wire codecs for the frames exchanged with the tap: Ethernet, IPv4/IPv6 and TCP.

pub mod checksum;
pub mod ip;
pub mod tcp;

pub use ip::{
    build_ethernet, build_ipv4, build_ipv6, EthernetFrame, IpPacket, MacAddr, ETHERTYPE_IPV4,
    ETHERTYPE_IPV6,
};
pub use tcp::{TcpFlags, TcpOptions, TcpSegment, TcpSegmentBuilder};

pub const IPPROTO_TCP: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    Truncated,
    Malformed(&'static str),
    Unsupported(&'static str),
    BufferTooSmall,
}

impl PacketError {
    pub fn reason(&self) -> &'static str {
        match self {
            PacketError::Truncated => "truncated",
            PacketError::Malformed(why) | PacketError::Unsupported(why) => why,
            PacketError::BufferTooSmall => "output buffer too small",
        }
    }
}

fn ensure_len(data: &[u8], len: usize) -> Result<(), PacketError> {
    if data.len() < len {
        return Err(PacketError::Truncated);
    }
    Ok(())
}
