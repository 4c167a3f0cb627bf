//! Pairwise clock synchronization.
//!
//! Each node periodically challenges its peers; a peer answers with its own
//! send time and its table of known offsets. From the history of
//! (remote send time, local time) pairs the synchronizer fits a line and
//! takes the intercept as the pairwise offset — the points sit in the past,
//! so the intercept at "now" approximates the offset without ever scaling
//! the local clock by a slope. Per-peer offsets are blended into one scalar
//! skew by a confidence-weighted average, with confidence decaying for
//! peers that stop answering. The scheduler reads that skew on every phase
//! change.

use {
    dgi_core::{Message, MessageKind, NodeId, SubTree},
    log::{debug, info, warn},
    std::collections::{HashMap, VecDeque},
};

/// Cap on the regression history per peer (pairs of points).
const MAX_REGRESSION_ENTRIES: usize = 200;

/// Per-query decay applied to the confidence of a silent peer.
const SYNCHRONIZER_LAMBDA: f64 = 0.99999;

/// Weight penalty applied to second-hand table entries.
const GOSSIP_WEIGHT_PENALTY: f64 = 0.1;

/// Pairwise clock-synchronization state for one node.
pub struct ClockSynchronizer {
    me: NodeId,
    /// Offset (seconds) such that `local + offset ≈ peer clock`, per peer.
    offsets: HashMap<NodeId, f64>,
    /// Confidence in each offset at the time it was set.
    weights: HashMap<NodeId, f64>,
    /// Slope residue of the fit, per peer.
    skews: HashMap<NodeId, f64>,
    /// Query counter at which each weight was last refreshed.
    last_response: HashMap<NodeId, u64>,
    /// Outstanding challenges: peer -> (k, local send time ms).
    queries: HashMap<NodeId, (u64, u64)>,
    /// Regression history: peer -> (remote seconds, local seconds) pairs.
    responses: HashMap<NodeId, VecDeque<(f64, f64)>>,
    kcounter: u64,
    my_offset_secs: f64,
    my_skew: f64,
}

impl ClockSynchronizer {
    /// Create the synchronizer for the node named `me`.
    pub fn new(me: NodeId) -> Self {
        let mut sync = ClockSynchronizer {
            me: me.clone(),
            offsets: HashMap::new(),
            weights: HashMap::new(),
            skews: HashMap::new(),
            last_response: HashMap::new(),
            queries: HashMap::new(),
            responses: HashMap::new(),
            kcounter: 0,
            my_offset_secs: 0.0,
            my_skew: 0.0,
        };
        sync.reset_self_entry(&me);
        sync
    }

    /// Current skew estimate in milliseconds (`local + skew ≈ consensus`).
    pub fn offset_ms(&self) -> i64 {
        (self.my_offset_secs * 1_000.0) as i64
    }

    // ── Exchange round ──────────────────────────────────────────────────

    /// Issue one round of challenges. `peers` is the full directory in its
    /// natural order; the send order is circularly shifted around `me` to
    /// spread traffic. Also folds the offset table into the aggregate skew.
    pub fn exchange(&mut self, peers: &[NodeId], now_ms: u64) -> Vec<(NodeId, Message)> {
        let mut after: Vec<&NodeId> = Vec::new();
        let mut before: Vec<&NodeId> = Vec::new();
        let mut seen_self = false;
        for peer in peers {
            if *peer == self.me {
                seen_self = true;
            } else if seen_self {
                after.push(peer);
            } else {
                before.push(peer);
            }
        }
        after.extend(before);

        let mut sends = Vec::new();
        for peer in after {
            sends.push(((*peer).clone(), self.challenge_message(self.kcounter)));
            self.queries
                .insert((*peer).clone(), (self.kcounter, now_ms));
        }
        self.kcounter += 1;

        let me = self.me.clone();
        self.reset_self_entry(&me);
        self.recompute_aggregate();
        self.reset_self_entry(&me);
        sends
    }

    /// Answer a challenge from a peer.
    pub fn on_exchange(&mut self, msg: &Message) -> Option<Message> {
        let k: u64 = msg.sub.get_parsed("clk.query")?;
        Some(self.response_message(k))
    }

    /// Fold a challenge response into the pairwise regression.
    pub fn on_exchange_response(&mut self, from: &NodeId, msg: &Message, now_ms: u64) {
        let Some(k) = msg.sub.get_parsed::<u64>("clk.response") else {
            warn!("malformed exchange response from {from}");
            return;
        };
        match self.queries.get(from) {
            Some((sent_k, _)) if *sent_k == k => {}
            _ => return, // stale or unsolicited
        }
        let (_, challenge_ms) = self.queries.remove(from).expect("checked above");
        let response_secs = msg.sent_at_ms as f64 / 1_000.0;
        let challenge_secs = challenge_ms as f64 / 1_000.0;
        let now_secs = now_ms as f64 / 1_000.0;

        let history = self.responses.entry(from.clone()).or_default();
        history.push_back((response_secs, challenge_secs));
        history.push_back((response_secs, now_secs));
        while history.len() > MAX_REGRESSION_ENTRIES * 2 {
            history.pop_front();
            history.pop_front();
        }

        // Fit against a base of "now" so the intercept is the offset.
        let base = now_secs;
        let n = history.len() as f64;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_lag = 0.0;
        let mut even = false;
        for (x, y) in history.iter() {
            sum_x += x - base;
            sum_y += y - base;
            // Challenge/receipt pairs alternate; their difference is the
            // round trip, which the intercept must not absorb.
            if even {
                sum_lag += y - base;
            } else {
                sum_lag -= y - base;
            }
            even = !even;
        }
        let lag = sum_lag / n;
        if lag < 0.015 {
            debug!("computed lag ({from}): {lag:.6}");
        } else {
            warn!("computed lag ({from}): {lag:.6}");
        }
        let xbar = sum_x / n;
        let ybar = sum_y / n;

        let mut sxy = 0.0;
        let mut sxx = 0.0;
        for (x, y) in history.iter() {
            let dx = (x - base) - xbar;
            let dy = (y - base) - ybar;
            sxy += dx * dy;
            sxx += dx * dx;
        }
        // No spread means a single x coordinate: slope 1.
        let fij = if sxx != 0.0 { sxy / sxx } else { 1.0 };
        let mut alpha = ybar - fij * xbar;
        if alpha <= 0.0 {
            alpha += lag;
        } else {
            alpha -= lag;
        }

        self.offsets.insert(from.clone(), -alpha);
        self.set_weight(from.clone(), 1.0);
        self.skews.insert(from.clone(), fij - 1.0);

        // Merge the peer's table so offsets propagate second-hand.
        if let Some(table) = msg.sub.get_child("clk.table") {
            let link_offset = -alpha;
            let link_skew = fij - 1.0;
            for entry in table.trees("entry") {
                let Some(neighbor) = entry.get("uuid").map(NodeId::from) else {
                    continue;
                };
                if neighbor == *from || neighbor == self.me {
                    continue;
                }
                let cjl: f64 = entry.get_parsed("offset").unwrap_or(0.0);
                let wjl: f64 =
                    entry.get_parsed::<f64>("weight").unwrap_or(0.0) - GOSSIP_WEIGHT_PENALTY;
                let fjl: f64 = entry.get_parsed("skew").unwrap_or(0.0);
                let current = self.weight_of(&neighbor);
                if current < wjl {
                    self.offsets.insert(neighbor.clone(), link_offset + cjl);
                    self.set_weight(neighbor.clone(), wjl);
                    self.skews.insert(neighbor, link_skew + fjl);
                }
            }
        }
    }

    // ── Aggregation ─────────────────────────────────────────────────────

    fn recompute_aggregate(&mut self) {
        let mut weighted_offset = 0.0;
        let mut weighted_skew = 0.0;
        let mut total_weight = 0.0;
        for (peer, offset) in &self.offsets {
            let w = self.weight_of(peer);
            weighted_offset += w * offset;
            weighted_skew += w * self.skews.get(peer).copied().unwrap_or(0.0);
            total_weight += w;
        }
        if total_weight != 0.0 {
            self.my_offset_secs = weighted_offset / total_weight;
            self.my_skew = weighted_skew / total_weight;
            info!("adjusting skew to {} ms", self.offset_ms());
        }
    }

    fn weight_of(&self, peer: &NodeId) -> f64 {
        if *peer == self.me {
            return 1.0;
        }
        let Some(weight) = self.weights.get(peer) else {
            return 0.0;
        };
        let age = self
            .kcounter
            .saturating_sub(self.last_response.get(peer).copied().unwrap_or(0));
        weight * SYNCHRONIZER_LAMBDA.powi(age as i32)
    }

    fn set_weight(&mut self, peer: NodeId, weight: f64) {
        self.last_response.insert(peer.clone(), self.kcounter);
        self.weights.insert(peer, weight);
    }

    fn reset_self_entry(&mut self, me: &NodeId) {
        self.offsets.insert(me.clone(), 0.0);
        self.skews.insert(me.clone(), 0.0);
        self.set_weight(me.clone(), 1.0);
    }

    // ── Message construction ────────────────────────────────────────────

    fn challenge_message(&self, k: u64) -> Message {
        let mut msg = Message::new("clk.Exchange");
        msg.kind = MessageKind::ClockReading;
        // Clock traffic is self-timestamped and matched by query counter,
        // so a frame arriving outside the sequence window is still usable;
        // the accept flag lets the reliable protocol deliver it anyway.
        msg.accept = true;
        msg.sub.put("clk.query", k.to_string());
        msg.sub.put("clk.offset", format!("{:.6}", self.my_offset_secs));
        msg.sub.put("clk.skew", format!("{:.6}", self.my_skew));
        msg
    }

    fn response_message(&self, k: u64) -> Message {
        let mut msg = Message::new("clk.ExchangeResponse");
        msg.kind = MessageKind::ClockReading;
        msg.accept = true;
        msg.sub.put("clk.response", k.to_string());
        for (peer, offset) in &self.offsets {
            let mut entry = SubTree::new();
            entry.add("uuid", peer.as_str());
            entry.add("offset", format!("{offset:.6}"));
            entry.add("skew", format!("{:.6}", self.skews.get(peer).copied().unwrap_or(0.0)));
            entry.add("weight", format!("{:.6}", self.weight_of(peer)));
            msg.sub.add_child("clk.table.entry", entry);
        }
        msg
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: &str) -> NodeId {
        NodeId::from(n)
    }

    /// Run one full challenge/response cycle between `a` (local clock
    /// `a_now`) and a peer whose clock runs `delta_ms` ahead, with zero
    /// network delay.
    fn run_cycle(a: &mut ClockSynchronizer, peer: &NodeId, a_now: u64, delta_ms: i64) {
        let sends = a.exchange(&[a.me.clone(), peer.clone()], a_now);
        assert_eq!(sends.len(), 1);
        let k: u64 = sends[0].1.sub.get_parsed("clk.query").unwrap();
        let mut response = Message::new("clk.ExchangeResponse");
        response.kind = MessageKind::ClockReading;
        response.sub.put("clk.response", k.to_string());
        response.sent_at_ms = (a_now as i64 + delta_ms) as u64;
        a.on_exchange_response(peer, &response, a_now);
    }

    #[test]
    fn test_offset_tracks_peer_ahead() {
        let peer = node("b:1870");
        let mut a = ClockSynchronizer::new(node("a:1870"));
        for i in 0..5u64 {
            run_cycle(&mut a, &peer, 100_000 + i * 1_000, 2_000);
        }
        // Pairwise offset should be close to +2 s.
        let pairwise = a.offsets[&peer];
        assert!(
            (pairwise - 2.0).abs() < 0.1,
            "pairwise offset {pairwise} not near 2.0"
        );
        // The aggregate splits the difference with the zero self entry.
        a.exchange(&[a.me.clone(), peer.clone()], 200_000);
        let skew = a.offset_ms();
        assert!(
            (skew - 1_000).abs() < 100,
            "aggregate skew {skew} not near 1000 ms"
        );
    }

    #[test]
    fn test_offset_zero_for_synced_peer() {
        let peer = node("b:1870");
        let mut a = ClockSynchronizer::new(node("a:1870"));
        for i in 0..5u64 {
            run_cycle(&mut a, &peer, 100_000 + i * 1_000, 0);
        }
        a.exchange(&[a.me.clone(), peer.clone()], 200_000);
        assert!(a.offset_ms().abs() < 50, "skew {} not near 0", a.offset_ms());
    }

    #[test]
    fn test_stale_response_ignored() {
        let peer = node("b:1870");
        let mut a = ClockSynchronizer::new(node("a:1870"));
        let mut response = Message::new("clk.ExchangeResponse");
        response.kind = MessageKind::ClockReading;
        response.sub.put("clk.response", "99");
        response.sent_at_ms = 5_000;
        a.on_exchange_response(&peer, &response, 1_000);
        assert!(a.offsets.get(&peer).is_none());
    }

    #[test]
    fn test_clock_messages_permit_out_of_window_acceptance() {
        let peer = node("b:1870");
        let mut a = ClockSynchronizer::new(node("a:1870"));
        let sends = a.exchange(&[a.me.clone(), peer], 1_000);
        assert!(sends[0].1.accept, "challenge carries the accept flag");
        let mut challenge = Message::new("clk.Exchange");
        challenge.sub.put("clk.query", "0");
        let response = a.on_exchange(&challenge).unwrap();
        assert!(response.accept, "response carries the accept flag");
    }

    #[test]
    fn test_exchange_response_carries_table() {
        let peer = node("b:1870");
        let mut a = ClockSynchronizer::new(node("a:1870"));
        run_cycle(&mut a, &peer, 50_000, 500);
        let mut challenge = Message::new("clk.Exchange");
        challenge.sub.put("clk.query", "7");
        let response = a.on_exchange(&challenge).unwrap();
        assert_eq!(response.sub.get("clk.response"), Some("7"));
        let uuids: Vec<&str> = response
            .sub
            .get_child("clk.table")
            .unwrap()
            .trees("entry")
            .map(|e| e.get("uuid").unwrap())
            .collect();
        assert!(uuids.contains(&"a:1870"));
        assert!(uuids.contains(&"b:1870"));
    }

    #[test]
    fn test_gossip_adopts_higher_confidence_entry() {
        let peer = node("b:1870");
        let third = node("c:1870");
        let mut a = ClockSynchronizer::new(node("a:1870"));
        let sends = a.exchange(&[a.me.clone(), peer.clone()], 10_000);
        let k: u64 = sends[0].1.sub.get_parsed("clk.query").unwrap();
        let mut response = Message::new("clk.ExchangeResponse");
        response.kind = MessageKind::ClockReading;
        response.sub.put("clk.response", k.to_string());
        response.sent_at_ms = 10_000;
        let mut entry = SubTree::new();
        entry.add("uuid", third.as_str());
        entry.add("offset", "1.5");
        entry.add("skew", "0.0");
        entry.add("weight", "0.9");
        response.sub.add_child("clk.table.entry", entry);
        a.on_exchange_response(&peer, &response, 10_000);
        // c was unknown; the discounted second-hand entry is adopted.
        let via_gossip = a.offsets[&third];
        assert!((via_gossip - 1.5).abs() < 0.1, "gossip offset {via_gossip}");
    }
}
