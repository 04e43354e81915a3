// End-to-end scenario tests for the controller fan-out pipeline.
//
// Each test starts a real relay on an OS-assigned port and drives it
// with raw TCP peers through `TestPeer`. The scenarios cover the whole
// service lifecycle: broadcast delivery, non-controller discards, peer
// churn against the capacity limit, controller hand-off, and payloads
// larger than the relay's per-cycle read buffer.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use fanout_tests::{TestPeer, settle, start_test_relay};
use hubcast_relay::MESSAGE_BUFFER_SIZE;
use hubcast_relay::server::RelayHandle;

/// Start a relay and connect three peers. The first one in is the
/// controller.
fn start_trio() -> (RelayHandle, TestPeer, TestPeer, TestPeer) {
    let (handle, addr) = start_test_relay(8);
    let controller = TestPeer::connect(addr);
    let first = TestPeer::connect(addr);
    let second = TestPeer::connect(addr);
    settle();
    (handle, controller, first, second)
}

/// Start a relay and connect a controller plus one recipient.
fn start_pair() -> (RelayHandle, SocketAddr, TestPeer, TestPeer) {
    let (handle, addr) = start_test_relay(8);
    let controller = TestPeer::connect(addr);
    let recipient = TestPeer::connect(addr);
    settle();
    (handle, addr, controller, recipient)
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

#[test]
fn controller_broadcast_is_byte_exact() {
    let (handle, mut a, mut b, mut c) = start_trio();

    // A realistic controller payload: a serialized command that the
    // recipients parse back out of the raw byte stream.
    let command = serde_json::json!({"id": 1});
    let payload = serde_json::to_vec(&command).unwrap();

    a.send(&payload);

    let got = b.recv(payload.len());
    assert_eq!(got, payload);
    let parsed: serde_json::Value = serde_json::from_slice(&got).unwrap();
    assert_eq!(parsed, command);

    c.expect(&payload);
    a.expect_silence();

    handle.stop();
}

#[test]
fn recipients_only_ever_see_controller_bytes() {
    let (handle, mut a, mut b, mut c) = start_trio();

    // Non-controller traffic before, between, and after a broadcast is
    // discarded without leaking into anyone's stream.
    b.send(b"noise");
    settle();
    a.send(b"alpha");
    settle();
    b.send(b"more noise");
    settle();

    c.expect(b"alpha");
    c.expect_silence();
    a.expect_silence();

    handle.stop();
}

#[test]
fn late_peer_sees_only_subsequent_messages() {
    let (handle, addr, mut a, mut b) = start_pair();

    a.send(b"early");
    b.expect(b"early");
    settle();

    // Nothing is persisted: a newcomer starts from the next broadcast.
    let mut late = TestPeer::connect(addr);
    settle();

    a.send(b"late");
    late.expect(b"late");
    late.expect_silence();
    b.expect(b"late");

    handle.stop();
}

#[test]
fn oversized_payload_survives_relay_cycles() {
    let (handle, _addr, mut a, mut b) = start_pair();

    // One send larger than the relay's read buffer arrives over several
    // read/fan-out cycles with order and content intact.
    let payload: Vec<u8> = (0..MESSAGE_BUFFER_SIZE + 500)
        .map(|i| (i % 251) as u8)
        .collect();
    a.send(&payload);

    b.expect(&payload);

    handle.stop();
}

#[test]
fn churn_does_not_break_the_capacity_limit() {
    let (handle, addr) = start_test_relay(3);

    let mut a = TestPeer::connect(addr);
    let mut b = TestPeer::connect(addr);
    let c = TestPeer::connect(addr);
    settle();

    // Table is full: the fourth peer is refused and closed.
    let mut refused = TestPeer::connect(addr);
    refused.expect_eof();

    // A departure frees the slot for the next arrival.
    drop(c);
    settle();
    let mut e = TestPeer::connect(addr);
    settle();

    a.send(b"after churn");
    b.expect(b"after churn");
    e.expect(b"after churn");

    handle.stop();
}

#[test]
fn controller_handoff_keeps_the_relay_usable() {
    let (handle, addr, mut a, mut b) = start_pair();

    a.send(b"first era");
    b.expect(b"first era");

    // The controller leaves; the next arrival inherits the role and the
    // surviving recipient keeps receiving without reconnecting.
    drop(a);
    settle();
    let mut c = TestPeer::connect(addr);
    settle();

    c.send(b"second era");
    b.expect(b"second era");

    b.send(b"still not a controller");
    settle();
    c.expect_silence();

    handle.stop();
}

#[test]
fn idle_peers_stay_connected() {
    let (handle, _addr, mut a, mut b) = start_pair();

    // No keepalives, no idle timeout: a quiet half second changes nothing.
    thread::sleep(Duration::from_millis(500));

    a.send(b"still here");
    b.expect(b"still here");

    handle.stop();
}
