//! Load balancing: the round-driven draft exchange.
//!
//! Each round the agent reads its gateway, classifies itself as supply,
//! demand, or normal against the announced norm, and tells the group.
//! Demand nodes are drafted by supply nodes and answer with the amount
//! they want migrated. The group leader additionally requests a global
//! snapshot each round and, when the collected state comes back, computes
//! the gross gateway norm and announces it.
//!
//! The scheduling discipline is the interesting part: `load_manage`
//! re-arms itself every `LB_ROUND_TIME` while enough of the phase
//! remains, and otherwise arms a next-round timer so the next run opens
//! the agent's next phase — the broker's rotation, not this agent,
//! decides when that is.

use {
    crate::{devices::DeviceIndex, group::process_peer_list, snapshot::ScAgent, Output},
    dgi_core::{Message, NodeId, Timings},
    dgi_sched::{Completion, TimerHandle},
    log::{debug, info},
    std::collections::{BTreeSet, HashMap},
};

/// Band around the norm inside which a node stays quiet.
const NORMAL_TOLERANCE: f64 = 0.5;

/// Timer continuations for the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbTask {
    /// Run one balancing round.
    LoadManage,
}

/// A node's relation to the announced norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbState {
    /// Generating more than the norm calls for.
    Supply,
    /// Drawing more than the norm calls for.
    Demand,
    /// Close enough to the norm.
    Normal,
}

/// Convenience alias for this agent's transition output.
pub type LbOutput = Output<LbTask>;

/// The load-balancing agent.
pub struct LbAgent {
    me: NodeId,
    timings: Timings,
    timer: TimerHandle,
    /// Group members (never contains me), refreshed by `PeerList`.
    group: BTreeSet<NodeId>,
    leader: NodeId,
    state: LbState,
    /// Last announced norm.
    norm: f64,
    /// Last local gateway reading.
    gateway: f64,
    /// What each peer last reported.
    peer_states: HashMap<NodeId, LbState>,
}

impl LbAgent {
    /// Create the agent. `timer` must be allocated to the `lb` module.
    pub fn new(me: NodeId, timings: Timings, timer: TimerHandle) -> Self {
        LbAgent {
            leader: me.clone(),
            me,
            timings,
            timer,
            group: BTreeSet::new(),
            state: LbState::Normal,
            norm: 0.0,
            gateway: 0.0,
            peer_states: HashMap::new(),
        }
    }

    /// The classification computed by the last round.
    pub fn state(&self) -> LbState {
        self.state
    }

    /// The norm this node currently balances against.
    pub fn norm(&self) -> f64 {
        self.norm
    }

    /// Enter the loop: queue the first round on this module's phase.
    pub fn run(&mut self) -> LbOutput {
        let mut out = LbOutput::empty();
        out.queue.push(LbTask::LoadManage);
        out
    }

    // ── Scheduled tasks ─────────────────────────────────────────────────

    /// Route a timer completion.
    pub fn on_task(
        &mut self,
        task: LbTask,
        completion: Completion,
        time_remaining_ms: i64,
        devices: &dyn DeviceIndex,
    ) -> LbOutput {
        match task {
            LbTask::LoadManage => match completion {
                Completion::Normal => self.load_manage(time_remaining_ms, devices),
                Completion::Cancelled => {
                    debug!("load manage displaced, waiting for the next arm");
                    LbOutput::empty()
                }
            },
        }
    }

    /// One balancing round.
    fn load_manage(&mut self, time_remaining_ms: i64, devices: &dyn DeviceIndex) -> LbOutput {
        let mut out = LbOutput::empty();
        // Book the next round before doing this one: inside the phase if
        // the budget allows, otherwise at the start of our next phase.
        let round = self.timings.LB_ROUND_TIME;
        if time_remaining_ms > 2 * round as i64 {
            out.arm(self.timer, Some(round), LbTask::LoadManage);
            debug!("scheduled another round in {round} ms");
        } else {
            out.arm(self.timer, None, LbTask::LoadManage);
            debug!("phase nearly over, deferring next round");
        }

        self.gateway = devices.net_value("Sst", "gateway");
        self.state = if self.gateway > self.norm + NORMAL_TOLERANCE {
            LbState::Demand
        } else if self.gateway < self.norm - NORMAL_TOLERANCE {
            LbState::Supply
        } else {
            LbState::Normal
        };
        info!(
            "gateway {} vs norm {}: {:?}",
            self.gateway, self.norm, self.state
        );

        let announce = self.state_message();
        for peer in &self.group {
            out.send(peer.clone(), announce.clone());
        }

        // The leader drives the global picture: one snapshot per round.
        if self.leader == self.me {
            let request = ScAgent::request("lb", &self.me, &[("Sst", "gateway")]);
            out.send(self.me.clone(), request);
        }
        out
    }

    // ── Message handling ────────────────────────────────────────────────

    /// Handle a delivered message addressed to this module.
    pub fn handle(&mut self, msg: &Message, from: &NodeId, now_ms: u64) -> LbOutput {
        match msg.handler.as_str() {
            "any.PeerList" => self.handle_peer_list(msg, from),
            "lb.PeerList" => self.handle_peer_list(msg, from),
            "lb.CollectedState" => self.handle_collected_state(msg),
            "lb.ComputedNormal" => self.handle_computed_normal(msg),
            "lb.demand" => self.handle_demand(from, now_ms),
            "lb.supply" => self.note_peer_state(from, LbState::Supply),
            "lb.normal" => self.note_peer_state(from, LbState::Normal),
            "lb.drafting" => self.handle_drafting(from, now_ms),
            "lb.accept" => self.handle_accept(msg, from),
            _ => LbOutput::empty(),
        }
    }

    fn handle_peer_list(&mut self, msg: &Message, from: &NodeId) -> LbOutput {
        self.leader = from.clone();
        self.group = process_peer_list(msg)
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| *id != self.me)
            .collect();
        self.peer_states.retain(|id, _| self.group.contains(id));
        debug!("group now {:?} led by {}", self.group, self.leader);
        LbOutput::empty()
    }

    /// Leader: the snapshot came back; average the gateway readings and
    /// announce the norm.
    fn handle_collected_state(&mut self, msg: &Message) -> LbOutput {
        let readings: Vec<f64> = msg
            .sub
            .get_child("CollectedState")
            .and_then(|t| t.get_child("gateway"))
            .map(|g| {
                g.leaves("value")
                    .filter_map(|v| v.parse::<f64>().ok())
                    .collect()
            })
            .unwrap_or_default();
        if readings.is_empty() {
            debug!("collected state had no gateway readings");
            return LbOutput::empty();
        }
        self.norm = readings.iter().sum::<f64>() / readings.len() as f64;
        info!("computed normal {} from {} readings", self.norm, readings.len());
        let mut announce = Message::new("lb.ComputedNormal");
        announce.sub.put("lb.source", self.me.as_str());
        announce.sub.put("lb.cnorm", self.norm.to_string());
        let mut out = LbOutput::empty();
        for peer in &self.group {
            out.send(peer.clone(), announce.clone());
        }
        out
    }

    fn handle_computed_normal(&mut self, msg: &Message) -> LbOutput {
        if let Some(norm) = msg.sub.get_parsed::<f64>("lb.cnorm") {
            self.norm = norm;
            info!("adopted normal {norm}");
        }
        LbOutput::empty()
    }

    /// A peer wants power; draft it if we have any to give.
    fn handle_demand(&mut self, from: &NodeId, _now_ms: u64) -> LbOutput {
        self.peer_states.insert(from.clone(), LbState::Demand);
        let mut out = LbOutput::empty();
        if self.state == LbState::Supply {
            info!("drafting demand node {from}");
            let mut msg = Message::new("lb.drafting");
            msg.sub.put("lb.source", self.me.as_str());
            out.send(from.clone(), msg);
        }
        out
    }

    /// A supply node drafted us; answer with the amount we want.
    fn handle_drafting(&mut self, from: &NodeId, _now_ms: u64) -> LbOutput {
        let mut out = LbOutput::empty();
        if self.state == LbState::Demand {
            let amount = (self.gateway - self.norm).max(0.0);
            info!("accepting draft from {from} for {amount}");
            let mut msg = Message::new("lb.accept");
            msg.sub.put("lb.source", self.me.as_str());
            msg.sub.put("lb.value", amount.to_string());
            out.send(from.clone(), msg);
        }
        out
    }

    /// The drafted node answered: publish the migration.
    fn handle_accept(&mut self, msg: &Message, from: &NodeId) -> LbOutput {
        let amount = msg.sub.get_parsed::<f64>("lb.value").unwrap_or(0.0);
        info!("migration of {amount} toward {from} agreed");
        LbOutput::empty()
    }

    fn note_peer_state(&mut self, from: &NodeId, state: LbState) -> LbOutput {
        self.peer_states.insert(from.clone(), state);
        LbOutput::empty()
    }

    fn state_message(&self) -> Message {
        let kind = match self.state {
            LbState::Supply => "supply",
            LbState::Demand => "demand",
            LbState::Normal => "normal",
        };
        let mut msg = Message::new(format!("lb.{kind}"));
        msg.sub.put("lb.source", self.me.as_str());
        msg.sub.put("lb.value", self.gateway.to_string());
        msg
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
