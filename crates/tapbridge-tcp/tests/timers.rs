mod common;

use std::net::SocketAddr;

use common::*;
use tapbridge_tcp::packet::TcpFlags;
use tapbridge_tcp::{FwdDirection, PortFwd, TcpConfig};

fn remote() -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 1], 80))
}

fn cfg() -> TcpConfig {
    TcpConfig {
        fwd_out: PortFwd::parse(FwdDirection::Outbound, "all").unwrap(),
        ..TcpConfig::default()
    }
}

#[test]
fn idle_flow_is_aborted_and_index_reused_after_the_batch() {
    let cfg = TcpConfig {
        idle_timeout_ms: 5_000,
        max_connections: 1,
        ..cfg()
    };
    let mut engine = engine(cfg);
    let mut guest = Guest::new(42000, remote(), 10);
    let (fd, _) = establish(&mut engine, &mut guest, 0);
    assert_eq!(engine.next_deadline(), Some(5_000));

    engine.timer(4_999);
    assert_eq!(engine.table().len(), 1);

    engine.timer(5_000);
    assert!(engine.table().is_empty());
    assert!(engine.host().sock(fd).reset);
    let rst = single(engine.tap_mut().take());
    assert!(rst.segment().flags().contains(TcpFlags::RST));
    assert_eq!(engine.next_deadline(), None);

    // Released this batch: the index is not handed out yet.
    let mut next = Guest::new(42001, remote(), 10);
    next.syn(&mut engine, 5_001);
    assert!(engine.table().is_empty());
    engine.tap_mut().take();

    engine.defer_handler(5_001);
    let mut again = Guest::new(42002, remote(), 10);
    again.syn(&mut engine, 5_002);
    assert_eq!(engine.table().len(), 1);
    assert!(engine.table().get(0).is_ok());
}

#[test]
fn activity_postpones_idle_expiry() {
    let cfg = TcpConfig {
        idle_timeout_ms: 5_000,
        ..cfg()
    };
    let mut engine = engine(cfg);
    let mut guest = Guest::new(42003, remote(), 10);
    establish(&mut engine, &mut guest, 0);

    guest.send_data(&mut engine, b"keepalive", 4_000);
    engine.timer(5_000);
    assert_eq!(engine.table().len(), 1);
    assert_eq!(engine.next_deadline(), Some(9_000));
}

#[test]
fn retransmission_backs_off_then_resets() {
    let cfg = TcpConfig {
        max_retries: 2,
        ..cfg()
    };
    let mut engine = engine(cfg);
    let mut guest = Guest::new(42004, remote(), 10);
    let (fd, isn) = establish(&mut engine, &mut guest, 0);

    engine.host_mut().sock_mut(fd).rx.extend(b"0123456789");
    pump(&mut engine, 0);
    let original = single(engine.tap_mut().take());
    assert_eq!(original.segment().seq_number(), isn.wrapping_add(1));
    assert_eq!(engine.next_deadline(), Some(1_000));

    engine.timer(1_000);
    let retry = single(engine.tap_mut().take());
    assert_eq!(retry.segment().seq_number(), isn.wrapping_add(1));
    assert_eq!(retry.segment().payload(), b"0123456789");
    assert_eq!(engine.next_deadline(), Some(3_000));

    engine.timer(2_999);
    assert!(engine.tap_mut().take().is_empty());
    engine.timer(3_000);
    assert_eq!(single(engine.tap_mut().take()).segment().payload(), b"0123456789");
    assert_eq!(engine.next_deadline(), Some(7_000));

    engine.timer(7_000);
    let rst = single(engine.tap_mut().take());
    assert!(rst.segment().flags().contains(TcpFlags::RST));
    assert!(engine.table().is_empty());
    assert!(engine.host().sock(fd).reset);
    assert_eq!(engine.stats().retransmissions, 2);
    assert_eq!(engine.stats().flows_aborted, 1);
}

#[test]
fn late_ack_after_rewind_covers_everything_sent_before() {
    let mut engine = engine(cfg());
    let mut guest = Guest::new(42007, remote(), 10);
    let (fd, isn) = establish(&mut engine, &mut guest, 0);

    engine.host_mut().sock_mut(fd).rx.extend([7u8; 3000]);
    pump(&mut engine, 0);
    assert_eq!(engine.tap_mut().take().len(), 3);

    // The guest shrinks its window to 1024 bytes before anything is acknowledged.
    guest.window = 8;
    guest.send_ack(&mut engine, 500);
    engine.timer(1_000);
    let retry = single(engine.tap_mut().take());
    assert_eq!(retry.segment().seq_number(), isn.wrapping_add(1));
    assert_eq!(retry.segment().payload().len(), 1024);

    // Acknowledgment of the original transmission, arriving after the rewind.
    guest.window = 512;
    guest.ack = isn.wrapping_add(1 + 3000);
    guest.send_ack(&mut engine, 1_500);
    engine.timer(3_000);
    assert!(engine.tap_mut().take().is_empty());
    assert_eq!(engine.stats().retransmissions, 1);

    engine.host_mut().sock_mut(fd).rx.extend(b"tail");
    pump(&mut engine, 3_100);
    let next = single(engine.tap_mut().take());
    assert_eq!(next.segment().seq_number(), isn.wrapping_add(1 + 3000));
    assert_eq!(next.segment().payload(), b"tail");
}

#[test]
fn lost_syn_ack_is_retransmitted() {
    let mut engine = engine(cfg());
    let mut guest = Guest::new(42005, remote(), 10);
    guest.syn(&mut engine, 0);
    pump(&mut engine, 0);
    let first = single(engine.tap_mut().take());

    engine.timer(1_000);
    let again = single(engine.tap_mut().take());
    assert_eq!(again.segment().flags(), TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(again.segment().seq_number(), first.segment().seq_number());
}

#[test]
fn stalled_connect_times_out() {
    let cfg = TcpConfig {
        handshake_timeout_ms: 3_000,
        ..cfg()
    };
    let mut engine = engine(cfg);
    let mut guest = Guest::new(42006, remote(), 10);
    guest.syn(&mut engine, 0);
    let fd = engine.host().connects[0].2;

    engine.timer(2_999);
    assert_eq!(engine.table().len(), 1);
    engine.timer(3_000);
    assert!(engine.table().is_empty());
    assert!(engine.host().sock(fd).reset);
    assert!(single(engine.tap_mut().take()).segment().flags().contains(TcpFlags::RST));
}

#[test]
fn buffer_sizing_follows_connection_count() {
    let cfg = TcpConfig {
        low_buf_threshold: 2,
        ..cfg()
    };
    let mut engine = engine(cfg);
    assert!(engine.ctx().large_bufs);

    for port in 0..2 {
        Guest::new(43000 + port, remote(), 10).syn(&mut engine, 0);
    }
    let fds: Vec<_> = engine.host().connects.iter().map(|c| c.2).collect();
    assert!(fds.iter().all(|fd| engine.host().sock(*fd).large_bufs == Some(true)));

    engine.timer(10);
    assert!(!engine.ctx().large_bufs);
    Guest::new(43002, remote(), 10).syn(&mut engine, 10);
    let fd = engine.host().connects[2].2;
    assert_eq!(engine.host().sock(fd).large_bufs, Some(false));
}
