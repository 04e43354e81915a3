// Test-only peer for relay scenario tests.
//
// Wraps a raw `TcpStream` connected to a running relay with the small
// assertions the scenario tests keep making: send a payload, expect an
// exact byte range, expect silence, expect EOF. The relay applies no
// framing, so everything here works on raw byte ranges; `expect` uses
// `read_exact` and therefore tolerates the kernel splitting a delivery
// across reads.
//
// See also: `tests/relay_pipeline.rs` for the scenarios.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use hubcast_relay::server::{RelayConfig, RelayHandle, start_relay};

/// Ceiling for blocking reads that expect data.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `expect_silence` listens before declaring the line quiet.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(150);

/// Time for the relay loop to absorb accepts and disconnects. The loop
/// finishes a cycle in microseconds; this is slack for a loaded machine.
pub const SETTLE: Duration = Duration::from_millis(150);

/// Start a relay on an OS-assigned loopback port with the given peer limit.
pub fn start_test_relay(max_peers: usize) -> (RelayHandle, SocketAddr) {
    let config = RelayConfig {
        addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        max_peers: Some(max_peers),
    };
    let (handle, addr) = start_relay(config).expect("start_relay failed");
    // Give the listener thread a moment to start.
    thread::sleep(Duration::from_millis(50));
    (handle, addr)
}

/// Block long enough for the relay loop to process whatever the test
/// just did (connects, disconnects, a send it should ignore).
pub fn settle() {
    thread::sleep(SETTLE);
}

/// A raw peer connected to the relay under test.
pub struct TestPeer {
    stream: TcpStream,
}

impl TestPeer {
    /// Connect to the relay. Slot assignment follows accept order, so
    /// tests connect peers one at a time and `settle()` before relying
    /// on who the controller is.
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("TestPeer::connect failed");
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("set_read_timeout failed");
        Self { stream }
    }

    /// Send a payload in a single write.
    pub fn send(&mut self, payload: &[u8]) {
        self.stream.write_all(payload).expect("send failed");
    }

    /// Read exactly `expected.len()` bytes and compare.
    pub fn expect(&mut self, expected: &[u8]) {
        let got = self.recv(expected.len());
        assert_eq!(got, expected);
    }

    /// Read exactly `len` bytes and return them.
    pub fn recv(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).expect("recv failed");
        buf
    }

    /// Assert nothing arrives within `SILENCE_WINDOW`.
    pub fn expect_silence(&mut self) {
        self.stream
            .set_read_timeout(Some(SILENCE_WINDOW))
            .expect("set_read_timeout failed");
        let mut buf = [0u8; 64];
        match self.stream.read(&mut buf) {
            Ok(0) => panic!("connection closed while expecting silence"),
            Ok(count) => panic!("expected silence, got {count} bytes"),
            Err(err) => assert!(
                matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ),
                "expected a read timeout, got {err}"
            ),
        }
        self.stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("set_read_timeout failed");
    }

    /// Assert the relay closed this connection.
    pub fn expect_eof(&mut self) {
        let mut buf = [0u8; 64];
        let count = self.stream.read(&mut buf).expect("read failed");
        assert_eq!(count, 0, "expected EOF, got {count} bytes");
    }
}
