// Readiness multiplexing for the relay loop.
//
// `Multiplexer` wraps poll(2) over the connection table: one pollfd per slot
// up to the high-water mark, empty slots filled with a negative descriptor
// (which poll(2) ignores, keeping pollfd index == slot index). The pollfd
// buffer is reused across calls; nothing is allocated in steady state.
//
// Readiness mapping:
// - POLLIN and POLLHUP both surface as readable: a hang-up means the next
//   read returns zero bytes, and the caller's zero-length-read path frees
//   the slot.
// - POLLERR and POLLNVAL surface as the error condition.
// - Error and hang-up are reported by the kernel whether or not they were
//   registered, so errored peers are observed even with read-only interest.
//
// The relay registers readable interest only. Registering writable on an
// idle socket reports ready immediately, and the wait would never block.
//
// An interrupted wait (EINTR) returns an empty event slice, same as a
// timeout; callers restart their iteration on empty.

use std::io;
use std::time::Duration;

use crate::table::ConnTable;

/// Bitset of readiness conditions, used both to register interest on a slot
/// and to report which conditions fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    pub const ERROR: Interest = Interest(0b100);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.is_readable() {
            events |= libc::POLLIN;
        }
        if self.is_writable() {
            events |= libc::POLLOUT;
        }
        // POLLERR is output-only; the kernel reports it whether or not it
        // appears in the requested set.
        if self.is_error() {
            events |= libc::POLLERR;
        }
        events
    }

    fn from_poll_revents(revents: libc::c_short) -> Interest {
        let mut ready = Interest(0);
        if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            ready = ready | Interest::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            ready = ready | Interest::WRITABLE;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            ready = ready | Interest::ERROR;
        }
        ready
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// One slot that reported readiness.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub slot: usize,
    pub ready: Interest,
}

/// poll(2) wrapper watching every table slot up to the high-water mark.
pub struct Multiplexer {
    pollfds: Vec<libc::pollfd>,
    ready: Vec<Event>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            pollfds: Vec::new(),
            ready: Vec::new(),
        }
    }

    /// Block until at least one watched slot is ready, the timeout elapses
    /// (`None` = block forever), or a signal interrupts the wait. Returns
    /// the ready slots in ascending slot order; empty means "nothing to do,
    /// go around again".
    pub fn wait(&mut self, table: &ConnTable, timeout: Option<Duration>) -> io::Result<&[Event]> {
        self.pollfds.clear();
        for slot in 0..=table.high_water() {
            let fd = table.raw_fd(slot).unwrap_or(-1);
            let events = table.interest(slot).map_or(0, Interest::to_poll_events);
            self.pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }

        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let count = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        self.ready.clear();
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(&self.ready);
            }
            return Err(err);
        }
        if count == 0 {
            return Ok(&self.ready);
        }

        for (slot, pollfd) in self.pollfds.iter().enumerate() {
            if pollfd.revents != 0 {
                self.ready.push(Event {
                    slot,
                    ready: Interest::from_poll_revents(pollfd.revents),
                });
            }
        }
        Ok(&self.ready)
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    use crate::table::PeerConn;

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn peer_conn(stream: TcpStream, interest: Interest) -> PeerConn {
        let addr = stream.peer_addr().unwrap();
        PeerConn {
            stream,
            addr,
            interest,
        }
    }

    #[test]
    fn interest_bits_combine() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_error());
        assert!(Interest::ERROR.is_error());
    }

    #[test]
    fn wait_times_out_when_nothing_is_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let table = ConnTable::new(listener.as_raw_fd(), 8);
        let mut mux = Multiplexer::new();

        let events = mux.wait(&table, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn wait_reports_readable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnTable::new(listener.as_raw_fd(), 8);
        let (mut client, server) = tcp_pair();
        let slot = table
            .insert(peer_conn(server, Interest::READABLE))
            .unwrap();
        let mut mux = Multiplexer::new();

        client.write_all(b"hello").unwrap();

        let events = mux.wait(&table, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].slot, slot);
        assert!(events[0].ready.is_readable());
    }

    #[test]
    fn wait_reports_listener_on_pending_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let table = ConnTable::new(listener.as_raw_fd(), 8);
        let mut mux = Multiplexer::new();

        let _pending = TcpStream::connect(addr).unwrap();

        let events = mux.wait(&table, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].slot, 0);
        assert!(events[0].ready.is_readable());
    }

    #[test]
    fn peer_close_is_observed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnTable::new(listener.as_raw_fd(), 8);
        let (client, server) = tcp_pair();
        let slot = table
            .insert(peer_conn(server, Interest::READABLE))
            .unwrap();
        let mut mux = Multiplexer::new();

        drop(client);

        let events = mux.wait(&table, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].slot, slot);
        // An orderly close surfaces as readable (EOF on read); some stacks
        // raise the error condition too. Either way the slot gets reaped.
        assert!(events[0].ready.is_readable() || events[0].ready.is_error());
    }

    #[test]
    fn writable_reported_when_registered() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnTable::new(listener.as_raw_fd(), 8);
        let (_client, server) = tcp_pair();
        let slot = table
            .insert(peer_conn(server, Interest::READABLE | Interest::WRITABLE))
            .unwrap();
        let mut mux = Multiplexer::new();

        // A fresh socket's send buffer has room, so writable fires at once.
        let events = mux.wait(&table, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].slot, slot);
        assert!(events[0].ready.is_writable());
        assert!(!events[0].ready.is_readable());
    }
}
