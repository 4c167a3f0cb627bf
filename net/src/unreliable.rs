//! The best-effort protocol (`UNR`).
//!
//! Fire and forget: sends are stamped and written once, nothing is
//! retained and nothing is retransmitted. Used for high-rate,
//! self-timestamped telemetry where stale data is worse than lost data.
//! The receive side still tracks an expected sequence so that late
//! reordered datagrams are dropped rather than delivered out of order.

use {
    crate::protocol::{
        next_seq, seq_in_window, Protocol, ProtocolConfig, ProtocolOutput, Reception,
    },
    dgi_core::{Message, MessageKind, ProtocolKind, SEQUENCE_MODULO},
    log::trace,
};

/// Acceptance-window width once the first datagram has arrived.
const ACCEPT_WINDOW: u16 = 8;

/// Best-effort protocol instance for one peer.
pub struct UnreliableProtocol {
    cfg: ProtocolConfig,
    outseq: u16,
    inseq: u16,
    /// Widens the acceptance window until the first datagram arrives, so
    /// a peer can join mid-stream.
    accept_mod: u16,
    stopped: bool,
}

impl UnreliableProtocol {
    /// New instance; accepts anything until the stream position is known.
    pub fn new(cfg: ProtocolConfig) -> Self {
        UnreliableProtocol {
            cfg,
            outseq: 0,
            inseq: 0,
            accept_mod: SEQUENCE_MODULO / ACCEPT_WINDOW,
            stopped: false,
        }
    }
}

impl Protocol for UnreliableProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Unreliable
    }

    fn send(&mut self, mut msg: Message, now_ms: u64) -> ProtocolOutput {
        if self.stopped {
            return ProtocolOutput::empty();
        }
        msg.sequence = self.outseq;
        self.outseq = next_seq(self.outseq);
        msg.source = self.cfg.local.clone();
        msg.source_host = Some(self.cfg.local_host.clone());
        msg.protocol = ProtocolKind::Unreliable;
        msg.sent_at_ms = now_ms;
        ProtocolOutput::write(msg)
    }

    fn receive(&mut self, msg: &Message, _now_ms: u64) -> Reception {
        if self.stopped || msg.kind != MessageKind::Data {
            return Reception::default();
        }
        let span = ACCEPT_WINDOW.saturating_mul(self.accept_mod);
        if seq_in_window(msg.sequence, self.inseq, span) {
            self.accept_mod = 1;
            self.inseq = next_seq(msg.sequence);
            Reception {
                deliver: true,
                writes: Vec::new(),
            }
        } else {
            trace!(
                "dropping out-of-window datagram seq {} (expected {})",
                msg.sequence,
                self.inseq
            );
            Reception::default()
        }
    }

    fn receive_ack(&mut self, _msg: &Message, _now_ms: u64) -> ProtocolOutput {
        ProtocolOutput::empty()
    }

    fn on_resend(&mut self, _now_ms: u64) -> ProtocolOutput {
        ProtocolOutput::empty()
    }

    fn resend_deadline(&self) -> Option<u64> {
        None
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
