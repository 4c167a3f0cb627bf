//! The reliable sequenced protocols (`SRC` and `SRS`).
//!
//! Both disciplines share one state machine: a bounded outbound window of
//! unacknowledged frames with a buffer queued behind it, cumulative ACKs,
//! and SYN-delimited sessions. `SRC` runs a sliding window of several
//! frames; `SRS` is the same machine with a window of one, and it clears
//! its outbound state on every phase change so each phase starts a fresh
//! strict session.
//!
//! Session rules:
//! - The first send of a fresh session pushes a SYN at the head of the
//!   window. The receiver adopts `inseq` from the SYN and ACKs it.
//! - A SYN whose timestamp is strictly later than the last accepted one is
//!   a new session: the receiver flushes its own outbound state so both
//!   directions resync.
//! - A receiver that gets data before any SYN answers with a `BadRequest`
//!   resync request carrying the sender's timestamp; the sender answers
//!   each distinct request with a fresh SYN, rate-limited by a minimum
//!   inter-SYN interval so duplicate requests cannot start a resync storm.
//! - Expired frames are dropped from the window head; the next outbound
//!   frame carries the kill boundary so the receiver can skip the gap.

use {
    crate::protocol::{
        next_seq, prev_seq, seq_distance, seq_in_window, Protocol, ProtocolConfig,
        ProtocolOutput, Reception, SessionState,
    },
    dgi_core::{Expiry, Message, MessageKind, ProtocolKind, SEQUENCE_MODULO},
    log::{debug, trace},
    std::collections::VecDeque,
};

/// Outstanding-window bound for the sliding (`SRC`) variant.
pub const SLIDING_WINDOW: usize = 8;

/// Floor on the interval between SYNs we originate, ms.
pub const MIN_SYN_INTERVAL_MS: u64 = 50;

/// Reliable sequenced protocol instance for one peer.
pub struct ReliableProtocol {
    cfg: ProtocolConfig,
    kind: ProtocolKind,
    window_size: usize,
    reset_on_phase: bool,

    // Outbound.
    outseq: u16,
    outsync: bool,
    outsync_time: Option<u64>,
    window: VecDeque<Message>,
    buffer: VecDeque<Message>,
    send_kill: Option<u16>,
    send_kills: bool,
    resend_at: Option<u64>,
    last_syn_ms: Option<u64>,

    // Inbound.
    inseq: u16,
    insync: bool,
    insync_time: Option<u64>,
    inresyncs: u16,
    current_ack: Option<Message>,

    stopped: bool,
}

impl ReliableProtocol {
    /// The default sliding-window (`SRC`) variant.
    pub fn sliding(cfg: ProtocolConfig) -> Self {
        Self::with_shape(cfg, ProtocolKind::Reliable, SLIDING_WINDOW, false)
    }

    /// The strict-ordering (`SRS`) variant: window of one, reset per phase.
    pub fn strict(cfg: ProtocolConfig) -> Self {
        Self::with_shape(cfg, ProtocolKind::Strict, 1, true)
    }

    fn with_shape(
        cfg: ProtocolConfig,
        kind: ProtocolKind,
        window_size: usize,
        reset_on_phase: bool,
    ) -> Self {
        ReliableProtocol {
            cfg,
            kind,
            window_size,
            reset_on_phase,
            outseq: 0,
            outsync: false,
            outsync_time: None,
            window: VecDeque::new(),
            buffer: VecDeque::new(),
            send_kill: None,
            send_kills: false,
            resend_at: None,
            last_syn_ms: None,
            inseq: 0,
            insync: false,
            insync_time: None,
            inresyncs: 0,
            current_ack: None,
            stopped: false,
        }
    }

    /// Session lifecycle, derived for observability.
    pub fn session_state(&self) -> SessionState {
        if self.stopped {
            SessionState::Kill
        } else if !self.outsync && !self.insync {
            SessionState::Fresh
        } else if self.window.front().map(|m| m.kind) == Some(MessageKind::Syn) {
            SessionState::Syncing
        } else {
            SessionState::Open
        }
    }

    /// Outstanding window depth (tests and invariant checks).
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Number of inbound resynchronizations accepted so far.
    pub fn resync_count(&self) -> u16 {
        self.inresyncs
    }

    /// Next sequence the receive side expects.
    pub fn expected_seq(&self) -> u16 {
        self.inseq
    }

    fn stamp(&self, msg: &mut Message, now_ms: u64) {
        msg.source = self.cfg.local.clone();
        msg.source_host = Some(self.cfg.local_host.clone());
        msg.protocol = self.kind;
        msg.sent_at_ms = now_ms;
    }

    fn arm_resend(&mut self, now_ms: u64) {
        self.resend_at = Some(now_ms + self.cfg.resend_ms);
    }

    /// Push a SYN at the head of the window, if one is due.
    fn send_syn(&mut self, now_ms: u64) -> ProtocolOutput {
        if let Some(last) = self.last_syn_ms {
            if now_ms.saturating_sub(last) < MIN_SYN_INTERVAL_MS {
                trace!("suppressing SYN within the minimum interval");
                return ProtocolOutput::empty();
            }
        }
        let seq = match self.window.front() {
            None => {
                let seq = self.outseq;
                self.outseq = next_seq(self.outseq);
                seq
            }
            Some(front) if front.kind == MessageKind::Syn => {
                return ProtocolOutput::empty();
            }
            // Slot the SYN just before the unacknowledged head.
            Some(front) => prev_seq(front.sequence),
        };
        let mut syn = Message::new("");
        syn.kind = MessageKind::Syn;
        syn.sequence = seq;
        syn.never_expires();
        self.stamp(&mut syn, now_ms);
        self.window.push_front(syn.clone());
        self.outsync = true;
        self.last_syn_ms = Some(now_ms);
        self.arm_resend(now_ms);
        debug!("sent SYN seq {seq}");
        ProtocolOutput::write(syn)
    }

    /// Build, remember, and write the coalesced ACK for an accepted frame.
    fn send_ack(&mut self, msg: &Message, now_ms: u64) -> Message {
        let mut ack = Message::new("");
        ack.kind = MessageKind::Ack;
        ack.sequence = msg.sequence;
        ack.ack_hash = Some(msg.content_hash());
        ack.expires = msg.expires;
        self.stamp(&mut ack, now_ms);
        self.current_ack = Some(ack.clone());
        ack
    }

    /// Resync request sent when data arrives before any SYN.
    fn bad_request(&self, msg: &Message, now_ms: u64) -> Message {
        let mut nak = Message::new("");
        nak.kind = MessageKind::BadRequest;
        nak.sequence = self.inresyncs % SEQUENCE_MODULO;
        self.stamp(&mut nak, now_ms);
        // Echo the offending frame's timestamp so the peer can tell
        // distinct requests apart.
        nak.sent_at_ms = msg.sent_at_ms;
        nak
    }
}

impl Protocol for ReliableProtocol {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn send(&mut self, mut msg: Message, now_ms: u64) -> ProtocolOutput {
        if self.stopped {
            return ProtocolOutput::empty();
        }
        let mut out = ProtocolOutput::empty();
        if !self.outsync {
            out.merge(self.send_syn(now_ms));
        }
        msg.sequence = self.outseq;
        self.outseq = next_seq(self.outseq);
        self.stamp(&mut msg, now_ms);
        if msg.expires == Expiry::Unset {
            msg.expire_from(now_ms, self.cfg.default_expire_ms);
        }
        if self.window.len() < self.window_size {
            out.writes.push(msg.clone());
            self.window.push_back(msg);
            self.arm_resend(now_ms);
        } else {
            self.buffer.push_back(msg);
        }
        out
    }

    fn receive(&mut self, msg: &Message, now_ms: u64) -> Reception {
        if self.stopped {
            return Reception::default();
        }
        match msg.kind {
            MessageKind::BadRequest => {
                // The peer lost our session; resync unless the head of the
                // window is already a SYN for a request we've seen.
                let already_syncing =
                    self.window.front().map(|m| m.kind) == Some(MessageKind::Syn);
                if !already_syncing && self.outsync_time != Some(msg.sent_at_ms) {
                    debug!("resynchronizing connection (bad request)");
                    self.outsync_time = Some(msg.sent_at_ms);
                    let out = self.send_syn(now_ms);
                    return Reception {
                        deliver: false,
                        writes: out.writes,
                    };
                }
                Reception::default()
            }
            MessageKind::Syn => {
                if self.insync_time == Some(msg.sent_at_ms) {
                    trace!("duplicate SYN");
                    return Reception::default();
                }
                // A strictly later SYN than the one we accepted is a fresh
                // session: flush our own outbound state so both directions
                // restart cleanly.
                if let Some(prev) = self.insync_time {
                    if msg.sent_at_ms > prev {
                        debug!("fresh session from peer, flushing outbound window");
                        self.window.clear();
                        self.buffer.clear();
                        self.outsync = false;
                        self.send_kills = false;
                        self.send_kill = None;
                        self.resend_at = None;
                    }
                }
                self.inseq = next_seq(msg.sequence);
                self.insync_time = Some(msg.sent_at_ms);
                self.inresyncs = self.inresyncs.wrapping_add(1);
                self.insync = true;
                debug!("got SYN, expecting seq {}", self.inseq);
                let ack = self.send_ack(msg, now_ms);
                Reception {
                    deliver: false,
                    writes: vec![ack],
                }
            }
            MessageKind::Ack => Reception::default(),
            MessageKind::Data | MessageKind::ClockReading => {
                if !self.insync {
                    debug!("connection needs resync");
                    let nak = self.bad_request(msg, now_ms);
                    return Reception {
                        deliver: false,
                        writes: vec![nak],
                    };
                }
                let seq = msg.sequence;
                trace!(
                    "recv {} expected {} kill {:?}",
                    seq,
                    self.inseq,
                    msg.kill
                );
                if seq == self.inseq {
                    self.inseq = next_seq(self.inseq);
                    let ack = self.send_ack(msg, now_ms);
                    return Reception {
                        deliver: true,
                        writes: vec![ack],
                    };
                }
                // A kill boundary below the expected sequence with the
                // frame ahead of it means the gap was dropped by the
                // sender; skip it.
                if let Some(kill) = msg.kill {
                    if kill < self.inseq && seq > self.inseq {
                        self.inseq = next_seq(seq);
                        let ack = self.send_ack(msg, now_ms);
                        return Reception {
                            deliver: true,
                            writes: vec![ack],
                        };
                    }
                }
                if msg.accept {
                    // Out-of-window acceptance, no sequence bookkeeping.
                    return Reception {
                        deliver: true,
                        writes: Vec::new(),
                    };
                }
                let dist = seq_distance(self.inseq, seq);
                if dist >= SEQUENCE_MODULO / 2 {
                    // Stale retransmission: the peer missed our ACK.
                    let writes = self.current_ack.clone().into_iter().collect();
                    return Reception {
                        deliver: false,
                        writes,
                    };
                }
                if (dist as usize) < self.window_size.max(SLIDING_WINDOW) {
                    // Ahead but within the window: an out-of-order
                    // retransmission; the in-order frame is still coming.
                    return Reception::default();
                }
                // Implausibly far ahead: ask the peer to resync.
                debug!("seq {seq} implausibly far ahead of {}", self.inseq);
                let nak = self.bad_request(msg, now_ms);
                Reception {
                    deliver: false,
                    writes: vec![nak],
                }
            }
        }
    }

    fn receive_ack(&mut self, msg: &Message, _now_ms: u64) -> ProtocolOutput {
        if self.stopped {
            return ProtocolOutput::empty();
        }
        let acked = msg.sequence;
        let mut out = ProtocolOutput::empty();
        while let Some(front) = self.window.front() {
            let fseq = front.sequence;
            if !seq_in_window(acked, fseq, self.window_size.max(1) as u16) {
                break;
            }
            // ACK hash pins the exact frame when the head is what's acked.
            if fseq == acked {
                if let Some(hash) = msg.ack_hash {
                    if hash != front.content_hash() {
                        break;
                    }
                }
            }
            debug!("ACK covers seq {fseq}");
            self.send_kill = Some(fseq);
            self.send_kills = false;
            self.window.pop_front();
            if let Some(next) = self.buffer.pop_front() {
                out.writes.push(next.clone());
                self.window.push_back(next);
            }
        }
        if self.window.is_empty() {
            self.resend_at = None;
        }
        out
    }

    fn on_resend(&mut self, now_ms: u64) -> ProtocolOutput {
        if self.stopped {
            return ProtocolOutput::empty();
        }
        self.resend_at = None;
        // Drop expired heads; the receiver learns about the gap from the
        // kill boundary on the next frame.
        while let Some(front) = self.window.front() {
            if !front.is_expired(now_ms) {
                break;
            }
            debug!(
                "message expired: seq {} handler {}",
                front.sequence, front.handler
            );
            self.send_kills = true;
            self.window.pop_front();
        }
        let mut out = ProtocolOutput::empty();
        let head_seq = self.window.front().map(|m| m.sequence);
        if let Some(head) = head_seq {
            // A kill that would roll the sequence space backwards means the
            // numbers wrapped across the gap; resync instead of confusing
            // the receiver.
            if self.send_kills && self.send_kill.map_or(false, |k| k > head) {
                self.send_kills = false;
                self.send_kill = None;
                out.merge(self.send_syn(now_ms));
            }
        }
        if !self.window.is_empty() {
            if self.send_kills {
                if let Some(front) = self.window.front_mut() {
                    front.kill = self.send_kill;
                }
            }
            out.writes.extend(self.window.iter().cloned());
            self.arm_resend(now_ms);
        }
        out
    }

    fn resend_deadline(&self) -> Option<u64> {
        self.resend_at
    }

    fn change_phase(&mut self, _new_round: bool) {
        if self.reset_on_phase {
            self.outsync = false;
            self.window.clear();
            self.buffer.clear();
            self.resend_at = None;
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.resend_at = None;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
