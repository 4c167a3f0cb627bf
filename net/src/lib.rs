//! Reliable messaging over an unreliable datagram transport.
//!
//! One [`Endpoint`] owns the process's single UDP socket. Each remote peer
//! gets a [`Connection`] holding one instance of each of the three send
//! disciplines:
//!
//! | tag   | discipline |
//! |-------|------------|
//! | `UNR` | fire-and-forget, no state |
//! | `SRC` | sliding window, ACK coalescing, SYN session reset (default) |
//! | `SRS` | strict ordering, window of one, reset per phase |
//!
//! The protocol state machines are pure: they take a wall-clock reading
//! and return the frames to write, so every delivery/retransmission/resync
//! decision is unit-testable without a socket. The [`PeerRegistry`] is the
//! process-wide directory mapping identifier → connection, and the
//! [`Dispatcher`] routes delivered payloads to the modules registered for
//! their handler tag.

pub mod connection;
pub mod dispatcher;
pub mod endpoint;
pub mod protocol;
pub mod registry;
pub mod reliable;
pub mod unreliable;

pub use connection::{Connection, SendOutcome};
pub use dispatcher::Dispatcher;
pub use endpoint::{Endpoint, Inbound};
pub use protocol::{Protocol, ProtocolConfig, ProtocolOutput, Reception, SessionState};
pub use registry::PeerRegistry;
pub use reliable::ReliableProtocol;
pub use unreliable::UnreliableProtocol;
