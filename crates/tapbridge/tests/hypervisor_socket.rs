use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::net::UnixStream;

use tapbridge::tap::encode_frame;
use tapbridge::{QemuTap, TapError};
use tapbridge_pcap::PcapWriter;
use tapbridge_tcp::packet::{build_ethernet, MacAddr, ETHERTYPE_IPV4};
use tapbridge_tcp::{TapFrame, TapIo};

const OUR_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);
const GUEST_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 2]);

fn framed(frame: &[u8]) -> Vec<u8> {
    let mut out = VecDeque::new();
    encode_frame(&mut out, frame);
    out.into_iter().collect()
}

#[test]
fn hypervisor_can_reconnect_after_closing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tap.sock");
    let mut tap = QemuTap::bind(&path, OUR_MAC).unwrap();
    let listener_fd = tap.fd();

    let mut first = UnixStream::connect(&path).unwrap();
    assert!(tap.accept().unwrap());
    assert!(tap.is_connected());
    assert_ne!(tap.fd(), listener_fd);

    let eth = build_ethernet(OUR_MAC, GUEST_MAC, ETHERTYPE_IPV4, &[0u8; 20]);
    first.write_all(&framed(&eth)).unwrap();
    assert_eq!(tap.receive().unwrap(), vec![eth.clone()]);

    drop(first);
    assert!(matches!(tap.receive(), Err(TapError::Disconnected)));
    tap.disconnect();
    assert!(!tap.is_connected());
    assert_eq!(tap.fd(), listener_fd);

    let mut second = UnixStream::connect(&path).unwrap();
    assert!(tap.accept().unwrap());
    second.write_all(&framed(&eth)).unwrap();
    assert_eq!(tap.receive().unwrap().len(), 1);
}

#[test]
fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tap.sock");
    let first = QemuTap::bind(&path, OUR_MAC).unwrap();
    drop(first);
    assert!(path.exists());
    QemuTap::bind(&path, OUR_MAC).unwrap();
}

#[test]
fn both_directions_are_captured() {
    let dir = tempfile::tempdir().unwrap();
    let pcap = dir.path().join("trace.pcap");
    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let mut tap = QemuTap::from_stream(ours, OUR_MAC).unwrap();
    tap.set_capture(Box::new(PcapWriter::create(&pcap).unwrap()));

    let eth = build_ethernet(OUR_MAC, GUEST_MAC, ETHERTYPE_IPV4, &[0u8; 20]);
    theirs.write_all(&framed(&eth)).unwrap();
    tap.receive().unwrap();
    tap.send_frame(TapFrame {
        src: IpAddr::V4(Ipv4Addr::new(10, 0, 2, 2)),
        dst: IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)),
        protocol: 6,
        payload: &[0u8; 20],
        flow: 0,
    });
    tap.flush().unwrap();
    let mut prefix = [0u8; 4];
    theirs.read_exact(&mut prefix).unwrap();
    assert_eq!(u32::from_be_bytes(prefix), 14 + 20 + 20);
    drop(tap);

    let bytes = std::fs::read(&pcap).unwrap();
    // File header, then one record per direction.
    let first_len = u32::from_le_bytes(bytes[24 + 8..24 + 12].try_into().unwrap()) as usize;
    assert_eq!(first_len, eth.len());
    let second = 24 + 16 + first_len;
    let second_len = u32::from_le_bytes(bytes[second + 8..second + 12].try_into().unwrap()) as usize;
    assert_eq!(second_len, 14 + 20 + 20);
    assert_eq!(bytes.len(), second + 16 + second_len);
}
