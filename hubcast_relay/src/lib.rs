// hubcast_relay: controller fan-out TCP relay.
//
// One listening socket, many peers. The peer occupying slot 1 of the
// connection table is the controller; every payload it sends is relayed
// verbatim to every other connected peer. Peers never hear each other,
// only the controller.
//
// Module overview:
// - `table.rs`:  `ConnTable`, the slot-indexed registry of the listener and
//                all peer connections; slot 0 is the listener, slot 1 is the
//                controller, inserts reuse the lowest free slot.
// - `poll.rs`:   `Multiplexer`, a poll(2) wrapper reporting per-slot
//                readiness; the loop's single blocking point.
// - `server.rs`: `RelayConfig`, `Listener`, the relay loop, and the
//                `start_relay`/`RelayHandle` embedding API.
// - `client.rs`: outbound `connect(host, service)` used by the controller
//                and client binaries.
//
// Design decisions:
// - **No framing.** Payloads are opaque byte ranges up to
//   `MESSAGE_BUFFER_SIZE`; stream semantics may split or coalesce them.
// - **Single thread, one suspension point.** Every socket is non-blocking
//   and the loop only ever blocks inside the multiplexer's wait.
// - **Close-and-reap.** Any per-peer error, hang-up, or zero-length
//   read/write frees the slot; the relay itself never exits over a peer
//   fault.
// - **Slot 1 is the controller role.** If the controller disconnects, the
//   next accepted peer lands in slot 1 and fans out from then on.

pub mod client;
pub mod poll;
pub mod server;
pub mod table;

pub use client::{ConnectError, connect};
pub use server::{DEFAULT_PORT, RelayConfig, RelayHandle, SetupError, start_relay};
pub use table::{CONTROLLER_SLOT, ConnTable, LISTENER_SLOT};

/// Receive buffer size for one relay cycle; longer stream payloads are
/// simply relayed across multiple cycles.
pub const MESSAGE_BUFFER_SIZE: usize = 1024;
