//! Per-peer connection facade.
//!
//! A connection owns one instance of each send discipline for one remote
//! peer and routes frames to the instance named by their protocol tag.
//! Self-addressed sends never touch a protocol: they short-circuit into a
//! local delivery for the dispatcher.

use {
    crate::{
        protocol::{Protocol, ProtocolConfig, ProtocolOutput, Reception},
        reliable::ReliableProtocol,
        unreliable::UnreliableProtocol,
    },
    dgi_core::{Message, NodeId, ProtocolKind},
    log::trace,
    std::collections::HashMap,
};

/// What a send turned into.
#[derive(Debug)]
pub enum SendOutcome {
    /// Frames to write to the socket.
    Wire(Vec<Message>),
    /// The message was self-addressed; hand it to the dispatcher.
    Local(Message),
}

/// One remote peer's protocol table.
pub struct Connection {
    peer: NodeId,
    local: NodeId,
    protocols: HashMap<ProtocolKind, Box<dyn Protocol>>,
    default_protocol: ProtocolKind,
}

impl Connection {
    /// Create the connection with all three protocol instances.
    pub fn new(peer: NodeId, cfg: ProtocolConfig) -> Self {
        let local = cfg.local.clone();
        let mut protocols: HashMap<ProtocolKind, Box<dyn Protocol>> = HashMap::new();
        protocols.insert(
            ProtocolKind::Unreliable,
            Box::new(UnreliableProtocol::new(cfg.clone())),
        );
        protocols.insert(
            ProtocolKind::Reliable,
            Box::new(ReliableProtocol::sliding(cfg.clone())),
        );
        protocols.insert(ProtocolKind::Strict, Box::new(ReliableProtocol::strict(cfg)));
        Connection {
            peer,
            local,
            protocols,
            default_protocol: ProtocolKind::Reliable,
        }
    }

    /// The remote peer this connection talks to.
    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// Send a message using the discipline its protocol tag names (the
    /// default reliable discipline when the tag is unknown).
    pub fn send(&mut self, mut msg: Message, now_ms: u64) -> SendOutcome {
        if self.peer == self.local {
            msg.source = self.local.clone();
            msg.sent_at_ms = now_ms;
            trace!("loopback delivery of {}", msg.handler);
            return SendOutcome::Local(msg);
        }
        let kind = if self.protocols.contains_key(&msg.protocol) {
            msg.protocol
        } else {
            self.default_protocol
        };
        let proto = self.protocols.get_mut(&kind).expect("all kinds present");
        SendOutcome::Wire(proto.send(msg, now_ms).writes)
    }

    /// Offer an inbound frame to the protocol its tag names.
    pub fn receive(&mut self, msg: &Message, now_ms: u64) -> Reception {
        match self.protocols.get_mut(&msg.protocol) {
            Some(proto) => proto.receive(msg, now_ms),
            None => Reception::default(),
        }
    }

    /// Route an inbound acknowledgement.
    pub fn receive_ack(&mut self, msg: &Message, now_ms: u64) -> ProtocolOutput {
        match self.protocols.get_mut(&msg.protocol) {
            Some(proto) => proto.receive_ack(msg, now_ms),
            None => ProtocolOutput::empty(),
        }
    }

    /// Fire retransmissions on every protocol whose timer is due.
    pub fn on_resend(&mut self, now_ms: u64) -> ProtocolOutput {
        let mut out = ProtocolOutput::empty();
        for proto in self.protocols.values_mut() {
            if matches!(proto.resend_deadline(), Some(d) if d <= now_ms) {
                out.merge(proto.on_resend(now_ms));
            }
        }
        out
    }

    /// The earliest retransmission deadline across the protocol table.
    pub fn resend_deadline(&self) -> Option<u64> {
        self.protocols
            .values()
            .filter_map(|p| p.resend_deadline())
            .min()
    }

    /// Propagate a phase change to every protocol.
    pub fn change_phase(&mut self, new_round: bool) {
        for proto in self.protocols.values_mut() {
            proto.change_phase(new_round);
        }
    }

    /// Stop every protocol; further sends become no-ops.
    pub fn stop(&mut self) {
        for proto in self.protocols.values_mut() {
            proto.stop();
        }
    }
}
