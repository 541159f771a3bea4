#![cfg(target_os = "linux")]

use pingmux_packets::{build_echo_request, open_transport, TransportConfig, TransportKind};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

fn echo_roundtrip(kind: TransportKind, target: Ipv4Addr) -> Result<(), String> {
    let config = TransportConfig {
        kind,
        peer: Some(target),
        ..Default::default()
    };
    let mut handle = open_transport(&config).map_err(|err| format!("open transport: {err}"))?;
    let packet = build_echo_request(handle.echo_id, 7, 0, 16);
    handle
        .sink
        .send(target, &packet, None)
        .map_err(|err| format!("send: {err}"))?;

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let event = handle
            .source
            .recv(Some(deadline))
            .map_err(|err| format!("recv: {err}"))?;
        if event.id == handle.echo_id && event.seq == 7 {
            if event.ttl <= 0 {
                return Err(format!("reply TTL not reported: {}", event.ttl));
            }
            return Ok(());
        }
    }
}

// Needs the net.ipv4.ping_group_range sysctl to admit this process.
#[test]
#[ignore]
fn datagram_loopback_roundtrip() {
    echo_roundtrip(TransportKind::Datagram, Ipv4Addr::new(127, 0, 0, 1)).expect("datagram echo");
}

// Needs CAP_NET_RAW.
#[test]
#[ignore]
fn capture_loopback_roundtrip() {
    echo_roundtrip(TransportKind::Capture, Ipv4Addr::new(127, 0, 0, 1)).expect("capture echo");
}

// Two datagram transports must end up with distinct echo idents even
// when they ask for the same one.
#[test]
#[ignore]
fn datagram_ident_fallback() {
    let first = open_transport(&TransportConfig {
        kind: TransportKind::Datagram,
        ..Default::default()
    })
    .expect("first transport");
    let second = open_transport(&TransportConfig {
        kind: TransportKind::Datagram,
        requested_id: first.echo_id,
        ..Default::default()
    })
    .expect("second transport");
    assert_ne!(first.echo_id, second.echo_id);
}
