//! DGI Broker core types.
//!
//! This crate holds the vocabulary shared by every other crate in the
//! workspace:
//!
//! - [`NodeId`] / [`RemoteHost`] — how nodes are named and located.
//! - [`Message`] — the application-level frame carried in each datagram,
//!   together with its bincode framing and size cap.
//! - [`Timings`] — the protocol timing table loaded at startup.
//! - [`CoreError`] — the crate-wide error taxonomy.
//!
//! Nothing in here performs I/O; the types are plain values so that the
//! protocol and agent state machines built on top of them stay
//! deterministic and unit-testable.

pub mod error;
pub mod identifier;
pub mod message;
pub mod timings;

pub use error::{CoreError, Result};
pub use identifier::{NodeId, RemoteHost};
pub use message::{
    Expiry, Message, MessageKind, ProtocolKind, SubTree, SubValue, MAX_DATAGRAM,
    SEQUENCE_MODULO,
};
pub use timings::Timings;

/// Milliseconds since the UNIX epoch. The whole codebase talks about wall
/// clock time in this unit so that timestamps can cross the wire unchanged.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
