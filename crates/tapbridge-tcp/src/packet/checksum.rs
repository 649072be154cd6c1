use std::net::IpAddr;

use super::IPPROTO_TCP;

fn sum_u16_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += (last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 checksum of `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_u16_words(data, 0))
}

/// IPv4 header checksum, computed over a header whose checksum field is zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// TCP checksum including the pseudo-header for either family. Returns 0 when a segment carrying
/// its checksum verifies.
///
/// Mixed-family address pairs never occur on a flow; they are summed as-is.
pub fn tcp_checksum(src: IpAddr, dst: IpAddr, segment: &[u8]) -> u16 {
    let len = segment.len() as u32;
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum = sum_u16_words(&src.octets(), sum);
            sum = sum_u16_words(&dst.octets(), sum);
            sum += IPPROTO_TCP as u32;
            sum += len & 0xffff;
        }
        (src, dst) => {
            sum = sum_u16_words(&ip_octets(src), sum);
            sum = sum_u16_words(&ip_octets(dst), sum);
            sum += len >> 16;
            sum += len & 0xffff;
            sum += IPPROTO_TCP as u32;
        }
    }
    // Fold before adding the payload so large segments cannot overflow.
    sum = (sum & 0xffff) + (sum >> 16);
    fold(sum_u16_words(segment, sum))
}

fn ip_octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}
