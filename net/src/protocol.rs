//! The send-discipline interface shared by the three protocols.

use dgi_core::{Message, NodeId, ProtocolKind, RemoteHost, Timings, SEQUENCE_MODULO};

/// Frames a protocol wants written to the socket.
#[derive(Debug, Default)]
pub struct ProtocolOutput {
    /// Frames to transmit, in order.
    pub writes: Vec<Message>,
}

impl ProtocolOutput {
    /// No frames.
    pub fn empty() -> Self {
        ProtocolOutput::default()
    }

    /// A single frame.
    pub fn write(msg: Message) -> Self {
        ProtocolOutput { writes: vec![msg] }
    }

    /// Append another output's frames after this one's.
    pub fn merge(&mut self, other: ProtocolOutput) {
        self.writes.extend(other.writes);
    }
}

/// Outcome of offering an inbound frame to a protocol.
#[derive(Debug, Default)]
pub struct Reception {
    /// True when the frame should be handed to the dispatcher.
    pub deliver: bool,
    /// Control frames to write back (ACKs, resync requests).
    pub writes: Vec<Message>,
}

/// Session lifecycle of a reliable protocol instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No sequence established yet.
    Fresh,
    /// SYN sent but not yet acknowledged.
    Syncing,
    /// Normal send/receive.
    Open,
    /// Stopped; further sends are no-ops.
    Kill,
}

/// Identity and timing inputs every protocol instance needs.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// This node's identifier, stamped on outbound frames.
    pub local: NodeId,
    /// This node's reachable address, stamped on outbound frames.
    pub local_host: RemoteHost,
    /// Retransmission interval for the reliable disciplines, ms.
    pub resend_ms: u64,
    /// Default expiration applied to reliable sends, ms.
    pub default_expire_ms: u64,
}

impl ProtocolConfig {
    /// Build from the loaded timing table.
    pub fn from_timings(local: NodeId, local_host: RemoteHost, timings: &Timings) -> Self {
        ProtocolConfig {
            local,
            local_host,
            resend_ms: timings.CSRC_RESEND_TIME,
            default_expire_ms: timings.CSRC_DEFAULT_TIMEOUT,
        }
    }
}

/// One send discipline on one connection.
pub trait Protocol: Send {
    /// The wire tag this instance answers to.
    fn kind(&self) -> ProtocolKind;

    /// Stamp and transmit (or queue) an outbound message.
    fn send(&mut self, msg: Message, now_ms: u64) -> ProtocolOutput;

    /// Offer an inbound data/control frame.
    fn receive(&mut self, msg: &Message, now_ms: u64) -> Reception;

    /// Process an inbound acknowledgement.
    fn receive_ack(&mut self, msg: &Message, now_ms: u64) -> ProtocolOutput;

    /// The retransmission timer fired.
    fn on_resend(&mut self, now_ms: u64) -> ProtocolOutput;

    /// When the retransmission timer should next fire, if armed.
    fn resend_deadline(&self) -> Option<u64>;

    /// The scheduler changed phase (`new_round` when the rotation wrapped).
    fn change_phase(&mut self, _new_round: bool) {}

    /// Cancel timers and refuse further work.
    fn stop(&mut self);
}

/// `(seq + 1) mod 1024`.
pub fn next_seq(seq: u16) -> u16 {
    (seq + 1) % SEQUENCE_MODULO
}

/// `(seq - 1) mod 1024`.
pub fn prev_seq(seq: u16) -> u16 {
    if seq == 0 {
        SEQUENCE_MODULO - 1
    } else {
        seq - 1
    }
}

/// Forward distance from `start` to `seq` modulo the sequence space.
pub fn seq_distance(start: u16, seq: u16) -> u16 {
    (seq + SEQUENCE_MODULO - start) % SEQUENCE_MODULO
}

/// True when `seq` falls in the half-open window `[start, start + span)`
/// taken modulo the sequence space — the "closer in one direction"
/// interpretation used for cumulative ACKs and acceptance windows.
pub fn seq_in_window(seq: u16, start: u16, span: u16) -> bool {
    seq_distance(start, seq) < span
}
