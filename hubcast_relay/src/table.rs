// Connection table for the relay.
//
// `ConnTable` is the central registry that the relay loop drives. It owns the
// listening descriptor and every accepted peer connection, indexed by slot:
//
// - Slot 0 always holds the listening socket and is never reclaimed.
// - Slot 1, while occupied, is the controller: the one peer whose payloads
//   fan out to everybody else. `insert` scans for the lowest free slot
//   starting at 1, so after a controller disconnect the next accepted peer
//   inherits the role.
// - Remaining slots hold ordinary peers in accept order, with freed slots
//   reused lowest-first.
//
// The table is a heap vector that grows one entry at a time up to `capacity`
// and never shrinks; its length is therefore the high-water mark plus one,
// and the multiplexer watches exactly that prefix. Peers own their
// `TcpStream`, so clearing a slot (or handing a rejected connection back in
// `TableFull`) closes the descriptor through `Drop`; no leak is possible.
//
// All mutation happens from the relay loop's single thread; no locking.

use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;

use crate::poll::Interest;

/// Slot index of the listening socket.
pub const LISTENER_SLOT: usize = 0;

/// Slot index whose occupant is the controller.
pub const CONTROLLER_SLOT: usize = 1;

/// Capacity to assume when the platform refuses to report a descriptor limit.
const FALLBACK_CAPACITY: usize = 1024;

/// Maximum number of open descriptors for this process, queried once at
/// startup to size the connection table.
pub fn max_descriptors() -> usize {
    // sysconf returns -1 when the limit is indeterminate.
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit > 0 {
        limit as usize
    } else {
        FALLBACK_CAPACITY
    }
}

/// An accepted peer connection owned by the table.
#[derive(Debug)]
pub struct PeerConn {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub interest: Interest,
}

#[derive(Debug)]
enum Slot {
    Empty,
    Listener(RawFd),
    Peer(PeerConn),
}

/// Returned when every slot up to capacity is occupied. Carries the rejected
/// connection back so the caller decides its fate (usually: drop it, which
/// closes it).
#[derive(Debug, Error)]
#[error("connection table full")]
pub struct TableFull(pub PeerConn);

/// Slot-indexed registry of the listener and all peer connections.
#[derive(Debug)]
pub struct ConnTable {
    slots: Vec<Slot>,
    capacity: usize,
}

impl ConnTable {
    /// Create a table holding only the listening descriptor in slot 0.
    /// `capacity` bounds the total slot count, listener included.
    pub fn new(listener_fd: RawFd, capacity: usize) -> Self {
        Self {
            slots: vec![Slot::Listener(listener_fd)],
            capacity,
        }
    }

    /// Total slot count this table may grow to, listener included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest slot index ever occupied. Monotonically non-decreasing; freed
    /// slots stay watched, which costs a little and breaks nothing.
    pub fn high_water(&self) -> usize {
        self.slots.len() - 1
    }

    /// Place a peer in the lowest free slot at index 1 or above. When every
    /// index up to capacity is taken, the peer comes back in `TableFull`.
    pub fn insert(&mut self, peer: PeerConn) -> Result<usize, TableFull> {
        for slot in 1..self.slots.len() {
            if matches!(self.slots[slot], Slot::Empty) {
                self.slots[slot] = Slot::Peer(peer);
                return Ok(slot);
            }
        }
        if self.slots.len() < self.capacity {
            self.slots.push(Slot::Peer(peer));
            return Ok(self.slots.len() - 1);
        }
        Err(TableFull(peer))
    }

    /// Free a slot, closing its connection. Idempotent; slot 0 and
    /// out-of-range indices are ignored.
    pub fn remove(&mut self, slot: usize) {
        if slot == LISTENER_SLOT || slot >= self.slots.len() {
            return;
        }
        self.slots[slot] = Slot::Empty;
    }

    /// True iff `slot` is the controller slot and currently occupied.
    pub fn is_controller(&self, slot: usize) -> bool {
        slot == CONTROLLER_SLOT && self.occupied(slot)
    }

    pub fn occupied(&self, slot: usize) -> bool {
        !matches!(self.slots.get(slot), Some(Slot::Empty) | None)
    }

    pub fn peer(&self, slot: usize) -> Option<&PeerConn> {
        match self.slots.get(slot) {
            Some(Slot::Peer(peer)) => Some(peer),
            _ => None,
        }
    }

    pub fn peer_mut(&mut self, slot: usize) -> Option<&mut PeerConn> {
        match self.slots.get_mut(slot) {
            Some(Slot::Peer(peer)) => Some(peer),
            _ => None,
        }
    }

    /// Raw descriptor for a slot, `None` when empty. The multiplexer turns
    /// `None` into the negative sentinel poll(2) skips.
    pub fn raw_fd(&self, slot: usize) -> Option<RawFd> {
        match self.slots.get(slot) {
            Some(Slot::Listener(fd)) => Some(*fd),
            Some(Slot::Peer(peer)) => Some(peer.stream.as_raw_fd()),
            _ => None,
        }
    }

    /// Registered interest for a slot. The listener only ever wants reads.
    pub fn interest(&self, slot: usize) -> Option<Interest> {
        match self.slots.get(slot) {
            Some(Slot::Listener(_)) => Some(Interest::READABLE),
            Some(Slot::Peer(peer)) => Some(peer.interest),
            _ => None,
        }
    }

    /// Indices of all occupied peer slots, ascending. Excludes the listener.
    pub fn peer_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (1..self.slots.len()).filter(|&slot| matches!(self.slots[slot], Slot::Peer(_)))
    }

    /// Number of connected peers (controller included).
    pub fn peer_count(&self) -> usize {
        self.peer_slots().count()
    }
}
