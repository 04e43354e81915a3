// TCP relay server: the listener, the connection table, and the loop that
// drives them.
//
// Architecture: a single thread runs `run_relay`, and the multiplexer's
// blocking wait is that thread's only suspension point. Every socket
// (listener and peers) is non-blocking. One loop iteration handles at most
// one accept and at most one controller payload:
//
// - Listener readiness → accept one connection into the lowest free slot
//   (slot 1 first, so the earliest peer is the controller).
// - Peer readiness, scanned in slot order → zero-length reads and error
//   conditions free the slot; controller bytes stop the scan and fan out to
//   every other peer; non-controller bytes are drained and dropped.
// - A failed send during fan-out frees that one slot and delivery continues,
//   so a dead peer never blocks the rest.
//
// Startup errors (`SetupError`) are fatal and surface to the caller; once
// the loop runs, every fault is contained to the offending connection and
// the loop only exits when stopped or when the listener itself dies.
//
// Shutdown: `RelayHandle::stop` clears the `keep_running` flag, then makes a
// throwaway connection to the listener to bounce the loop out of its
// blocking wait. Dropping the table closes every descriptor.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::MESSAGE_BUFFER_SIZE;
use crate::poll::{Interest, Multiplexer};
use crate::table::{CONTROLLER_SLOT, ConnTable, LISTENER_SLOT, PeerConn, TableFull, max_descriptors};

/// Default listen port, matching the stock controller and client.
pub const DEFAULT_PORT: u16 = 8888;

/// Errors that can abort relay startup. Anything after a successful start is
/// per-connection and handled inside the loop.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("socket setup failed: {0}")]
    Socket(#[from] io::Error),
}

/// Configuration for starting a relay. Loadable from JSON; missing fields
/// take the defaults below.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind. Defaults to all interfaces.
    pub addr: IpAddr,
    /// Port to bind. Port 0 lets the OS pick, reported by `start_relay`.
    pub port: u16,
    /// Peer limit. `None` sizes the table by the platform descriptor limit.
    pub max_peers: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_peers: None,
        }
    }
}

impl RelayConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, SetupError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SetupError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: RelayConfig = serde_json::from_str(&text)
            .map_err(|e| SetupError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Total connection-table slot count: the configured peer limit plus the
    /// listener slot, or the platform descriptor limit when unset.
    pub fn table_capacity(&self) -> usize {
        match self.max_peers {
            Some(peers) => peers + 1,
            None => max_descriptors(),
        }
    }

    fn validate(&self) -> Result<(), SetupError> {
        if self.max_peers == Some(0) {
            return Err(SetupError::Config("max_peers must be at least 1".into()));
        }
        Ok(())
    }
}

/// The bound, listening socket. Slot 0 of the connection table.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind and listen per `config`. Any failure here is fatal; there is no
    /// retry.
    pub fn init(config: &RelayConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let addr = SocketAddr::new(config.addr, config.port);
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        // Backlog tracks the peer limit; the kernel clamps it to somaxconn.
        let backlog = config.table_capacity().min(1024) as i32;

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let inner: TcpListener = socket.into();
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept one pending connection. `WouldBlock` means the connection
    /// vanished between readiness and accept.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Handle returned by `start_relay` to control the running relay.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    addr: SocketAddr,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down. The loop sits
    /// in a blocking wait, so a throwaway connection bounces it awake.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        let mut nudge = self.addr;
        if nudge.ip().is_unspecified() {
            nudge.set_ip(match nudge.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        let _ = TcpStream::connect(nudge);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Start the relay on a background thread. Returns a handle for stopping it
/// and the actual bound address (useful when port 0 is used to let the OS
/// pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), SetupError> {
    let listener = Listener::init(&config)?;
    let addr = listener.local_addr()?;
    info!("relay listening on {addr}");

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_loop = keep_running.clone();
    let thread = thread::spawn(move || {
        run_relay(listener, config, keep_running_loop);
    });

    Ok((
        RelayHandle {
            keep_running,
            addr,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main relay loop. Runs until `keep_running` is cleared or the listening
/// socket itself fails.
fn run_relay(listener: Listener, config: RelayConfig, keep_running: Arc<AtomicBool>) {
    let capacity = config.table_capacity();
    let mut table = ConnTable::new(listener.as_raw_fd(), capacity);
    let mut mux = Multiplexer::new();
    let mut buf = [0u8; MESSAGE_BUFFER_SIZE];

    info!("relay loop running, table capacity {capacity} slots");

    while keep_running.load(Ordering::SeqCst) {
        let events = match mux.wait(&table, None) {
            Ok(events) => events,
            Err(e) => {
                error!("multiplexer wait failed: {e}");
                break;
            }
        };
        // Interrupted or spurious wake-up: go around again.
        if events.is_empty() {
            continue;
        }

        let mut remaining = events.len();
        if let Some(event) = events.iter().find(|event| event.slot == LISTENER_SLOT) {
            if event.ready.is_error() {
                error!("listening socket reported an error condition, stopping");
                break;
            }
            handle_accept(&listener, &mut table);
            remaining -= 1;
        }
        // Nothing ready beyond the listener: skip the peer scan.
        if remaining == 0 {
            continue;
        }

        // Scan ready peers in slot order. The scan stops at the first
        // controller payload: one controller message per cycle; whatever
        // goes unread re-reports on the next wait.
        let mut pending = None;
        for event in events {
            let slot = event.slot;
            if slot == LISTENER_SLOT {
                continue;
            }
            if event.ready.is_error() {
                if let Some(peer) = table.peer(slot) {
                    warn!("peer {} on slot {slot} errored, closing", peer.addr);
                }
                table.remove(slot);
                continue;
            }
            if !event.ready.is_readable() {
                continue;
            }
            let is_controller = table.is_controller(slot);
            let Some(peer) = table.peer_mut(slot) else {
                continue;
            };
            let addr = peer.addr;
            match peer.stream.read(&mut buf) {
                Ok(0) => {
                    info!("peer {addr} disconnected, slot {slot} freed");
                    table.remove(slot);
                }
                Ok(count) => {
                    if is_controller {
                        pending = Some(count);
                        break;
                    }
                    // Only the controller fans out; everyone else's bytes
                    // are drained and dropped.
                    debug!("discarding {count} bytes from non-controller peer {addr}");
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    // Stale readiness; the next wait re-reports anything real.
                }
                Err(e) => {
                    warn!("read from peer {addr} on slot {slot} failed, closing: {e}");
                    table.remove(slot);
                }
            }
        }

        if let Some(count) = pending {
            fan_out(&mut table, &buf[..count]);
        }
    }

    info!(
        "relay loop stopped, dropping {} peer connection(s)",
        table.peer_count()
    );
}

/// Accept one connection and place it in the table. Accept failures are
/// transient and never fatal. A full table refuses the connection by
/// dropping it; nobody else is disturbed.
fn handle_accept(listener: &Listener, table: &mut ConnTable) {
    let (stream, addr) = match listener.accept() {
        Ok(pair) => pair,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            debug!("pending connection vanished before accept");
            return;
        }
        Err(e) => {
            warn!("accept failed: {e}");
            return;
        }
    };
    if let Err(e) = stream.set_nonblocking(true) {
        warn!("cannot switch peer {addr} non-blocking, dropping: {e}");
        return;
    }

    let peer = PeerConn {
        stream,
        addr,
        interest: Interest::READABLE | Interest::ERROR,
    };
    match table.insert(peer) {
        Ok(slot) if table.is_controller(slot) => {
            info!("peer {addr} connected on slot {slot}, now the controller");
        }
        Ok(slot) => {
            info!("peer {addr} connected on slot {slot}");
        }
        Err(TableFull(refused)) => {
            warn!(
                "connection table full ({} slots), refusing peer {}",
                table.capacity(),
                refused.addr
            );
        }
    }
}

/// Send `payload` to every occupied peer slot except the controller's own
/// and the listener's. A failed or zero-length send closes that one peer;
/// the rest still get their copy.
fn fan_out(table: &mut ConnTable, payload: &[u8]) {
    let targets: Vec<usize> = table
        .peer_slots()
        .filter(|&slot| slot != CONTROLLER_SLOT)
        .collect();

    let mut delivered = 0usize;
    for slot in targets {
        let Some(peer) = table.peer_mut(slot) else {
            continue;
        };
        let addr = peer.addr;
        match peer.stream.write(payload) {
            Ok(0) => {
                warn!("peer {addr} on slot {slot} accepted no bytes, closing");
                table.remove(slot);
            }
            Ok(count) => {
                if count < payload.len() {
                    warn!("short send to peer {addr}: {count} of {} bytes", payload.len());
                }
                delivered += 1;
            }
            Err(e) => {
                warn!("send to peer {addr} on slot {slot} failed, closing: {e}");
                table.remove(slot);
            }
        }
    }
    debug!(
        "relayed {} bytes from controller to {delivered} peer(s)",
        payload.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(max_peers: Option<usize>) -> RelayConfig {
        RelayConfig {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            max_peers,
        }
    }

    fn write_temp_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn default_config_matches_the_daemon_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.max_peers, None);
    }

    #[test]
    fn table_capacity_counts_the_listener_slot() {
        let config = loopback_config(Some(8));
        assert_eq!(config.table_capacity(), 9);
    }

    #[test]
    fn table_capacity_defaults_to_the_platform_limit() {
        let config = loopback_config(None);
        assert_eq!(config.table_capacity(), max_descriptors());
    }

    #[test]
    fn config_parses_from_json_with_defaults() {
        let path = write_temp_config(
            "hubcast_relay_config_test.json",
            r#"{"port": 9100, "max_peers": 4}"#,
        );
        let config = RelayConfig::from_json_file(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.port, 9100);
        assert_eq!(config.max_peers, Some(4));
        assert_eq!(config.addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn config_json_rejects_zero_max_peers() {
        let path = write_temp_config("hubcast_relay_zero_peers.json", r#"{"max_peers": 0}"#);
        let result = RelayConfig::from_json_file(&path);
        fs::remove_file(&path).ok();

        assert!(matches!(result, Err(SetupError::Config(_))));
    }

    #[test]
    fn listener_rejects_zero_max_peers() {
        let config = loopback_config(Some(0));
        assert!(matches!(Listener::init(&config), Err(SetupError::Config(_))));
    }

    #[test]
    fn listener_binds_an_os_assigned_port() {
        let listener = Listener::init(&loopback_config(Some(4))).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn idle_listener_accept_would_block() {
        let listener = Listener::init(&loopback_config(Some(4))).unwrap();
        match listener.accept() {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            Ok(_) => panic!("accept on an idle listener returned a connection"),
        }
    }
}
