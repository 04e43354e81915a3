// Outbound connection support for relay peers.
//
// The controller and plain-client binaries both reach the relay through
// `connect(host, service)`: validate arguments, resolve the target, then try
// every resolved address in order. From the relay's point of view the two
// binaries are indistinguishable peers; all the role logic lives server-side
// in the slot assignment.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};

use thiserror::Error;
use tracing::debug;

/// Errors from `connect`. Arguments are checked before any I/O happens.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("host and service must be non-empty")]
    Param,
    #[error("cannot resolve {0}: {1}")]
    Resolve(String, io::Error),
    #[error("cannot connect to {0}: {1}")]
    Connect(String, io::Error),
}

/// Open a TCP connection to `host:service`. Every address resolution yields
/// is tried in order; the first success wins, and if all fail only the last
/// error is reported.
pub fn connect(host: &str, service: &str) -> Result<TcpStream, ConnectError> {
    if host.is_empty() || service.is_empty() {
        return Err(ConnectError::Param);
    }
    let target = format!("{host}:{service}");
    let port: u16 = service.parse().map_err(|_| {
        ConnectError::Resolve(
            target.clone(),
            io::Error::new(io::ErrorKind::InvalidInput, "service must be a decimal port"),
        )
    })?;
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ConnectError::Resolve(target.clone(), e))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                debug!("connected to {target} via {addr}");
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect attempt to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(ConnectError::Connect(
        target,
        last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "resolution returned no addresses")
        }),
    ))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn connects_to_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect("127.0.0.1", &port.to_string()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        assert_eq!(
            stream.local_addr().unwrap(),
            accepted.peer_addr().unwrap()
        );
    }

    #[test]
    fn empty_host_is_a_parameter_error() {
        assert!(matches!(connect("", "8888"), Err(ConnectError::Param)));
    }

    #[test]
    fn empty_service_is_a_parameter_error() {
        assert!(matches!(connect("127.0.0.1", ""), Err(ConnectError::Param)));
    }

    #[test]
    fn non_numeric_service_fails_resolution() {
        match connect("127.0.0.1", "not-a-port") {
            Err(ConnectError::Resolve(target, _)) => {
                assert_eq!(target, "127.0.0.1:not-a-port");
            }
            other => panic!("expected Resolve error, got {other:?}"),
        }
    }

    #[test]
    fn refused_connection_reports_the_last_error() {
        // Bind, note the port, then free it so the connect attempt is refused.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        match connect("127.0.0.1", &port.to_string()) {
            Err(ConnectError::Connect(target, _)) => {
                assert_eq!(target, format!("127.0.0.1:{port}"));
            }
            Ok(_) => panic!("connect to a freed port unexpectedly succeeded"),
            Err(other) => panic!("expected Connect error, got {other:?}"),
        }
    }
}
