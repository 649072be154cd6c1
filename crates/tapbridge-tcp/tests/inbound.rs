mod common;

use std::net::{IpAddr, SocketAddr};

use common::*;
use tapbridge_tcp::packet::TcpFlags;
use tapbridge_tcp::{Events, FlowKey, FwdDirection, Phase, PortFwd, TcpConfig};

fn inbound_cfg(spec: &str) -> TcpConfig {
    TcpConfig {
        fwd_in: PortFwd::parse(FwdDirection::Inbound, spec).unwrap(),
        ..TcpConfig::default()
    }
}

#[test]
fn listener_flow_until_host_reset() {
    let mut engine = engine(inbound_cfg("2222"));
    assert_eq!(engine.listeners().len(), 1);
    let listener = engine.listeners().iter().next().unwrap();
    assert_eq!(listener.addr, SocketAddr::from(([0, 0, 0, 0], 2222)));
    assert!(!listener.ns);

    let peer = SocketAddr::from(([192, 0, 2, 7], 50000));
    let fd = engine.host_mut().incoming(2222, false, peer);
    pump(&mut engine, 0);
    assert!(engine.host().sock(fd).large_bufs.is_some());

    let syn = single(engine.tap_mut().take());
    let seg = syn.segment();
    let mut guest = Guest::new(2222, peer, 5000);
    let key = FlowKey::new(guest.local, guest.remote);
    assert_eq!(seg.flags(), TcpFlags::SYN);
    assert_eq!(seg.seq_number(), secret().isn(&key, 0));
    assert_eq!(seg.src_port(), 50000);
    assert_eq!(seg.dst_port(), 2222);
    assert_eq!(syn.src, peer.ip());
    assert_eq!(seg.parsed_options().wscale, Some(8));
    assert_eq!(engine.table().get(0).unwrap().phase(), Phase::TapSynSent);

    let isn = seg.seq_number();
    guest.syn_ack(&mut engine, isn, 1);
    let ack = single(engine.tap_mut().take());
    assert_eq!(ack.segment().flags(), TcpFlags::ACK);
    assert_eq!(ack.segment().ack_number(), 5001);
    assert_eq!(ack.segment().seq_number(), isn.wrapping_add(1));
    assert_eq!(engine.table().get(0).unwrap().phase(), Phase::Established);

    engine.host_mut().sock_mut(fd).rx.extend(b"hello");
    pump(&mut engine, 2);
    let data = single(engine.tap_mut().take());
    assert_eq!(data.segment().payload(), b"hello");
    assert_eq!(data.segment().seq_number(), isn.wrapping_add(1));
    guest.receive(&data);
    guest.send_data(&mut engine, b"world", 3);
    assert_eq!(engine.host().sock(fd).tx, b"world");
    engine.tap_mut().take();

    // The host peer goes away: the guest sees a reset and the record is gone before the batch
    // ends.
    engine.host_mut().sock_mut(fd).peer_reset = true;
    let (token, _) = engine.host().watched[&fd];
    engine.dispatch(token, Events::ERR | Events::HUP, 4);
    assert!(engine.table().is_empty());
    let rst = single(engine.tap_mut().take());
    assert!(rst.segment().flags().contains(TcpFlags::RST));
    assert_eq!(rst.segment().seq_number(), isn.wrapping_add(6));
    assert!(engine.host().sock(fd).reset);
    assert_eq!(engine.stats().flows_aborted, 1);
    assert_eq!(engine.stats().active_tap, 0);

    // A late event for the released record is ignored.
    engine.dispatch(token, Events::IN, 5);
    assert_eq!(engine.stats().stale_events, 1);
    assert!(engine.tap_mut().take().is_empty());
}

#[test]
fn guest_reset_during_handshake_resets_host() {
    let mut engine = engine(inbound_cfg("2222"));
    let peer = SocketAddr::from(([192, 0, 2, 7], 50001));
    let fd = engine.host_mut().incoming(2222, false, peer);
    pump(&mut engine, 0);
    let syn = single(engine.tap_mut().take());

    let mut guest = Guest::new(2222, peer, 1);
    // A reset that does not acknowledge our SYN is not the guest's answer to it.
    guest.send_rst(&mut engine, 1);
    assert_eq!(engine.table().len(), 1);

    guest.ack = syn.segment().seq_number().wrapping_add(1);
    let rst = guest.segment(guest.seq, TcpFlags::RST | TcpFlags::ACK, &[], &[]);
    engine.tap_handler(guest.local.ip(), guest.remote.ip(), &rst, 1);
    assert!(engine.table().is_empty());
    assert!(engine.host().sock(fd).reset);
    assert!(engine.tap_mut().take().is_empty(), "no reset answers a reset");
}

#[test]
fn loopback_peers_appear_as_gateway() {
    let mut engine = engine(inbound_cfg("8022:22"));
    let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
    engine.host_mut().incoming(8022, false, peer);
    pump(&mut engine, 0);

    let syn = single(engine.tap_mut().take());
    assert_eq!(syn.src, IpAddr::V4(GATEWAY_IP));
    assert_eq!(syn.segment().dst_port(), 22);
}

#[test]
fn accepted_sockets_are_closed_when_table_is_full() {
    let cfg = TcpConfig {
        max_connections: 1,
        ..inbound_cfg("2222")
    };
    let mut engine = engine(cfg);
    let first = engine
        .host_mut()
        .incoming(2222, false, SocketAddr::from(([192, 0, 2, 7], 1)));
    let second = engine
        .host_mut()
        .incoming(2222, false, SocketAddr::from(([192, 0, 2, 7], 2)));
    pump(&mut engine, 0);

    assert_eq!(engine.table().len(), 1);
    assert!(!engine.host().sock(first).closed);
    assert!(engine.host().sock(second).closed);
    assert_eq!(engine.stats().rejected, 1);
}

#[test]
fn ipv6_peers_without_guest_address_are_refused() {
    let mut engine = engine(inbound_cfg("2222"));
    let peer: SocketAddr = "[2001:db8::1]:5555".parse().unwrap();
    let fd = engine.host_mut().incoming(2222, false, peer);
    pump(&mut engine, 0);

    assert!(engine.table().is_empty());
    assert!(engine.host().sock(fd).closed);
    assert!(engine.tap_mut().take().is_empty());
}

#[test]
fn shutdown_aborts_flows_and_closes_listeners() {
    let mut engine = engine(inbound_cfg("2222"));
    let listener = engine.host().listener_fd(2222, false);
    let fd = engine
        .host_mut()
        .incoming(2222, false, SocketAddr::from(([192, 0, 2, 7], 9)));
    pump(&mut engine, 0);
    engine.tap_mut().take();

    engine.shutdown(1);
    assert!(engine.table().is_empty());
    assert!(engine.host().sock(fd).reset);
    assert!(engine.host().sock(listener).closed);
    assert!(engine.listeners().is_empty());
    let rst = single(engine.tap_mut().take());
    assert!(rst.segment().flags().contains(TcpFlags::RST));
}

#[test]
fn all_binds_every_permitted_port_outside_the_ephemeral_range() {
    let mut engine = engine(inbound_cfg("all,~22"));
    let ephemeral = engine.config().ephemeral_ports.clone();
    let expected = 65535 - 1 - ephemeral.clone().count();
    assert_eq!(engine.listeners().len(), expected);
    assert!(engine
        .listeners()
        .iter()
        .all(|l| !l.ns && l.addr.ip().is_unspecified() && l.addr.port() == l.target_port));
    assert!(engine.listeners().iter().all(|l| l.addr.port() != 22));
    assert!(engine
        .listeners()
        .iter()
        .all(|l| !ephemeral.contains(&l.addr.port())));

    let peer = SocketAddr::from(([192, 0, 2, 7], 50002));
    engine.host_mut().incoming(443, false, peer);
    pump(&mut engine, 0);
    let syn = single(engine.tap_mut().take());
    assert_eq!(syn.segment().dst_port(), 443);
    assert_eq!(engine.stats().active_tap, 1);
}
