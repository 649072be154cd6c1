use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{checksum, ensure_len, PacketError};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
}

#[derive(Clone, Copy, Debug)]
pub struct EthernetFrame<'a> {
    data: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub const HEADER_LEN: usize = 14;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        Ok(Self { data })
    }

    pub fn dest_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[0..6]);
        MacAddr(mac)
    }

    pub fn src_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[6..12]);
        MacAddr(mac)
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[Self::HEADER_LEN..]
    }
}

pub fn build_ethernet(dest: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(EthernetFrame::HEADER_LEN + payload.len());
    out.extend_from_slice(&dest.0);
    out.extend_from_slice(&src.0);
    out.extend_from_slice(&ethertype.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Network-layer view of a packet: the addresses and the transport payload.
#[derive(Clone, Copy, Debug)]
pub struct IpPacket<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub payload: &'a [u8],
}

impl<'a> IpPacket<'a> {
    pub fn parse(ethertype: u16, data: &'a [u8]) -> Result<Self, PacketError> {
        match ethertype {
            ETHERTYPE_IPV4 => Self::parse_v4(data),
            ETHERTYPE_IPV6 => Self::parse_v6(data),
            _ => Err(PacketError::Unsupported("ethertype")),
        }
    }

    pub fn parse_v4(buf: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(buf, 20)?;
        let version = buf[0] >> 4;
        let ihl = (buf[0] & 0x0f) as usize;
        if version != 4 || ihl < 5 {
            return Err(PacketError::Malformed("invalid IPv4 header"));
        }
        let header_len = ihl * 4;
        ensure_len(buf, header_len)?;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < header_len || buf.len() < total_len {
            return Err(PacketError::Truncated);
        }
        let flags_fragment = u16::from_be_bytes([buf[6], buf[7]]);
        if flags_fragment & 0x3fff != 0 {
            return Err(PacketError::Unsupported("IPv4 fragment"));
        }
        Ok(Self {
            src: IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15])),
            dst: IpAddr::V4(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19])),
            protocol: buf[9],
            payload: &buf[header_len..total_len],
        })
    }

    /// Extension headers are not walked: only packets whose first next-header is the transport
    /// protocol are accepted.
    pub fn parse_v6(buf: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(buf, 40)?;
        if buf[0] >> 4 != 6 {
            return Err(PacketError::Malformed("invalid IPv6 header"));
        }
        let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        ensure_len(buf, 40 + payload_len)?;
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        dst.copy_from_slice(&buf[24..40]);
        Ok(Self {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol: buf[6],
            payload: &buf[40..40 + payload_len],
        })
    }
}

pub fn build_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, identification: u16, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut out = vec![0u8; 20];
    out[0] = (4u8 << 4) | 5;
    out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    out[4..6].copy_from_slice(&identification.to_be_bytes());
    out[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    out[8] = 64;
    out[9] = protocol;
    out[12..16].copy_from_slice(&src.octets());
    out[16..20].copy_from_slice(&dst.octets());
    let csum = checksum::ipv4_header_checksum(&out);
    out[10..12].copy_from_slice(&csum.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn build_ipv6(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, flow_label: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 40];
    let vtf = (6u32 << 28) | (flow_label & 0x000f_ffff);
    out[0..4].copy_from_slice(&vtf.to_be_bytes());
    out[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    out[6] = next_header;
    out[7] = 64;
    out[8..24].copy_from_slice(&src.octets());
    out[24..40].copy_from_slice(&dst.octets());
    out.extend_from_slice(payload);
    out
}
