use std::net::IpAddr;

use super::{checksum, ensure_len, PacketError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x0001);
    pub const SYN: TcpFlags = TcpFlags(0x0002);
    pub const RST: TcpFlags = TcpFlags(0x0004);
    pub const PSH: TcpFlags = TcpFlags(0x0008);
    pub const ACK: TcpFlags = TcpFlags(0x0010);
    pub const URG: TcpFlags = TcpFlags(0x0020);

    pub const fn empty() -> TcpFlags {
        TcpFlags(0)
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

pub const OPT_EOL: u8 = 0;
pub const OPT_NOP: u8 = 1;
pub const OPT_MSS: u8 = 2;
pub const OPT_WS: u8 = 3;

/// Largest window scale shift allowed by RFC 7323.
pub const MAX_WS: u8 = 14;

/// Options we care about from a SYN or SYN|ACK.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
}

impl TcpOptions {
    /// Parse the option area. Unknown options are skipped; a truncated option ends parsing.
    pub fn parse(mut opts: &[u8]) -> Self {
        let mut out = TcpOptions::default();
        while let Some(&kind) = opts.first() {
            match kind {
                OPT_EOL => break,
                OPT_NOP => {
                    opts = &opts[1..];
                    continue;
                }
                _ => {}
            }
            let Some(&len) = opts.get(1) else { break };
            let len = len as usize;
            if len < 2 || len > opts.len() {
                break;
            }
            match (kind, len) {
                (OPT_MSS, 4) => out.mss = Some(u16::from_be_bytes([opts[2], opts[3]])),
                (OPT_WS, 3) => out.wscale = Some(opts[2].min(MAX_WS)),
                _ => {}
            }
            opts = &opts[len..];
        }
        out
    }

    /// Encode as a 4-byte aligned option area: MSS, then NOP + window scale.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        if let Some(mss) = self.mss {
            out.push(OPT_MSS);
            out.push(4);
            out.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(ws) = self.wscale {
            out.extend_from_slice(&[OPT_NOP, OPT_WS, 3, ws]);
        }
        out
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpSegment<'a> {
    pub const MIN_HEADER_LEN: usize = 20;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        let header_len = (data_offset as usize) * 4;
        ensure_len(data, header_len)?;
        Ok(Self { data, header_len })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn seq_number(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn ack_number(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags(self.data[13] as u16)
    }

    pub fn window_size(&self) -> u16 {
        u16::from_be_bytes([self.data[14], self.data[15]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[16], self.data[17]])
    }

    pub fn options(&self) -> &'a [u8] {
        &self.data[Self::MIN_HEADER_LEN..self.header_len]
    }

    pub fn parsed_options(&self) -> TcpOptions {
        TcpOptions::parse(self.options())
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Sequence space consumed: payload plus one for each of SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let flags = self.flags();
        self.payload().len() as u32
            + flags.contains(TcpFlags::SYN) as u32
            + flags.contains(TcpFlags::FIN) as u32
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn checksum_valid(&self, src: IpAddr, dst: IpAddr) -> bool {
        checksum::tcp_checksum(src, dst, self.as_bytes()) == 0
    }
}

#[derive(Clone, Debug)]
pub struct TcpSegmentBuilder<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> TcpSegmentBuilder<'a> {
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            flags,
            window_size: 0,
            options: &[],
            payload: &[],
        }
    }

    pub fn window(mut self, window_size: u16) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn options(mut self, options: &'a [u8]) -> Self {
        self.options = options;
        self
    }

    pub fn payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }

    pub fn header_len(&self) -> Result<usize, PacketError> {
        if self.options.len() % 4 != 0 {
            return Err(PacketError::Malformed("TCP options length not multiple of 4"));
        }
        let header_len = TcpSegment::MIN_HEADER_LEN + self.options.len();
        if header_len / 4 > 0x0f {
            return Err(PacketError::Malformed("TCP header too large"));
        }
        Ok(header_len)
    }

    pub fn len(&self) -> Result<usize, PacketError> {
        Ok(self.header_len()? + self.payload.len())
    }

    pub fn write(&self, src_ip: IpAddr, dst_ip: IpAddr, out: &mut [u8]) -> Result<usize, PacketError> {
        let header_len = self.header_len()?;
        let len = self.len()?;
        if out.len() < len {
            return Err(PacketError::BufferTooSmall);
        }

        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        out[12] = ((header_len / 4) as u8) << 4;
        out[13] = (self.flags.0 & 0xff) as u8;
        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        out[16..18].copy_from_slice(&0u16.to_be_bytes());
        out[18..20].copy_from_slice(&0u16.to_be_bytes());
        out[20..header_len].copy_from_slice(self.options);
        out[header_len..len].copy_from_slice(self.payload);

        // A computed checksum of 0x0000 is valid for TCP and is written as-is.
        let csum = checksum::tcp_checksum(src_ip, dst_ip, &out[..len]);
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        Ok(len)
    }

    pub fn build(&self, src_ip: IpAddr, dst_ip: IpAddr) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        let written = self.write(src_ip, dst_ip, &mut buf)?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }
}
