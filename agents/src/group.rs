//! Group management: invitation-based leader election.
//!
//! Every node keeps a directory of known peers, a current group, and a
//! coordinator. Coordinators probe each other with Are-You-Coordinator;
//! when several coordinators discover each other, the one with the
//! lexicographically smallest identifier waits the least before merging,
//! so groups converge on the smallest-named reachable node. Members probe
//! their coordinator with Are-You-There and fall back to recovery (a solo
//! group) when it stops answering. Membership changes reach the rest of
//! the system only through the `PeerList` message, which is also looped
//! back to this node's own modules.
//!
//! All timers run through the scheduler's registry. Continuations are the
//! [`GmTask`] enum: the broker delivers the task back with a completion
//! code when the timer fires or is displaced, which mirrors how the
//! election steps chain into each other.

use {
    crate::{devices::DeviceIndex, Output},
    dgi_core::{Expiry, Message, NodeId, RemoteHost, SubTree, Timings},
    dgi_sched::{Completion, TimerHandle},
    log::{debug, info, warn},
    std::collections::{BTreeMap, BTreeSet, HashMap},
};

/// Election states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// In a group, doing useful work.
    Normal,
    /// Holding or participating in an election.
    Election,
    /// Group formed, waiting for the membership push.
    Reorganization,
    /// Rebuilding a solo group.
    Recovery,
}

/// Timer continuations for the election state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmTask {
    /// Probe for other coordinators (coordinator steady state).
    Check,
    /// Collect AYC responses and back off before merging.
    Premerge,
    /// Send invitations and form the new group.
    Merge,
    /// Push the membership list and return to normal operation.
    Reorganize,
    /// Probe the coordinator (member steady state).
    Timeout,
    /// The coordinator went silent; rebuild solo.
    Recovery,
    /// Poll the FID state.
    FidCheck,
}

/// Convenience alias for this agent's transition output.
pub type GmOutput = Output<GmTask>;

/// The group-management agent.
pub struct GmAgent {
    me: NodeId,
    timings: Timings,
    /// Directory of every peer ever mentioned, with addresses.
    known: BTreeMap<NodeId, RemoteHost>,
    /// Members of my current group (never contains me).
    up_nodes: BTreeSet<NodeId>,
    /// Coordinators discovered by the last AYC round.
    coordinators: BTreeSet<NodeId>,
    /// Peers we are awaiting an AYC response from, with the send time.
    ayc_expected: HashMap<NodeId, u64>,
    /// Peers we are awaiting an AYT response from, with the send time.
    ayt_expected: HashMap<NodeId, u64>,
    role: Role,
    group_id: u64,
    leader: NodeId,
    group_counter: u64,
    probe_seq: u64,
    fids_closed: bool,
    timer: TimerHandle,
    fid_timer: TimerHandle,
    // Formation statistics, reported in the state summary.
    groups_formed: u32,
    groups_broken: u32,
    elections_started: u32,
    groups_joined: u32,
}

impl GmAgent {
    /// Create the agent. `timer` and `fid_timer` must be allocated to the
    /// `gm` module in the scheduler's registry.
    pub fn new(
        me: NodeId,
        my_host: RemoteHost,
        timings: Timings,
        timer: TimerHandle,
        fid_timer: TimerHandle,
    ) -> Self {
        let mut known = BTreeMap::new();
        known.insert(me.clone(), my_host);
        GmAgent {
            leader: me.clone(),
            me,
            timings,
            known,
            up_nodes: BTreeSet::new(),
            coordinators: BTreeSet::new(),
            ayc_expected: HashMap::new(),
            ayt_expected: HashMap::new(),
            role: Role::Normal,
            group_id: 0,
            group_counter: rand::random::<u32>() as u64,
            probe_seq: 0,
            fids_closed: true,
            timer,
            fid_timer,
            groups_formed: 0,
            groups_broken: 0,
            elections_started: 0,
            groups_joined: 0,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// The current coordinator.
    pub fn coordinator(&self) -> &NodeId {
        &self.leader
    }

    /// True when this node considers itself the coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.leader == self.me
    }

    /// Current election state.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Members of the current group, this node excluded.
    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.up_nodes
    }

    /// Epoch counter of the current group.
    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    // ── Startup ─────────────────────────────────────────────────────────

    /// Enter the algorithm: register the statically configured peers,
    /// start the FID poll, and form a solo group.
    pub fn run(&mut self, hosts: &[(NodeId, RemoteHost)], now_ms: u64) -> GmOutput {
        for (id, host) in hosts {
            info!("registering peer {id}");
            self.known.insert(id.clone(), host.clone());
        }
        let mut out = self.recovery(now_ms);
        out.arm(
            self.fid_timer,
            Some(self.timings.GM_FID_TIMEOUT),
            GmTask::FidCheck,
        );
        out
    }

    // ── Election steps (timer continuations) ────────────────────────────

    /// Route a timer completion to the step it continues.
    pub fn on_task(
        &mut self,
        task: GmTask,
        completion: Completion,
        now_ms: u64,
        devices: &dyn DeviceIndex,
    ) -> GmOutput {
        match task {
            GmTask::Check => self.check(completion, now_ms),
            GmTask::Premerge => self.premerge(completion, now_ms),
            GmTask::Merge => self.merge(completion, now_ms),
            GmTask::Reorganize => self.reorganize(completion, now_ms),
            GmTask::Timeout => self.timeout(completion, now_ms),
            GmTask::Recovery => self.recovery_timer(completion, now_ms),
            GmTask::FidCheck => self.fid_check(completion, devices),
        }
    }

    /// Reset into a solo group and return to the steady-state loop.
    fn recovery(&mut self, _now_ms: u64) -> GmOutput {
        info!("+ state change ELECTION (recovery)");
        self.role = Role::Election;
        self.group_counter += 1;
        self.group_id = self.group_counter;
        self.leader = self.me.clone();
        self.up_nodes.clear();
        info!("changed group: {} ({})", self.group_id, self.leader);
        self.role = Role::Reorganization;
        self.role = Role::Normal;
        info!("+ state change NORMAL (recovery)");
        let mut out = self.push_peer_list();
        out.arm(self.timer, Some(self.timings.GM_CHECK_TIMEOUT), GmTask::Check);
        out
    }

    fn recovery_timer(&mut self, completion: Completion, now_ms: u64) -> GmOutput {
        match completion {
            Completion::Normal => {
                self.groups_broken += 1;
                self.recovery(now_ms)
            }
            Completion::Cancelled => {
                // The recovery countdown was displaced by a membership
                // push; members fall back to probing the coordinator.
                if !self.is_coordinator() {
                    let mut out = GmOutput::empty();
                    out.arm(
                        self.timer,
                        Some(self.timings.GM_TIMEOUT_TIMEOUT),
                        GmTask::Timeout,
                    );
                    out
                } else {
                    GmOutput::empty()
                }
            }
        }
    }

    /// Coordinator steady state: ask every known peer whether they also
    /// consider themselves a coordinator.
    fn check(&mut self, completion: Completion, now_ms: u64) -> GmOutput {
        if completion == Completion::Cancelled {
            return GmOutput::empty();
        }
        self.log_system_state();
        let mut out = GmOutput::empty();
        if self.role == Role::Normal && self.is_coordinator() {
            self.coordinators.clear();
            self.ayc_expected.clear();
            let msg = self.are_you_coordinator(now_ms);
            info!("send: sending out AYC");
            let peers: Vec<NodeId> = self
                .known
                .keys()
                .filter(|id| **id != self.me)
                .cloned()
                .collect();
            for peer in peers {
                self.ayc_expected.insert(peer.clone(), now_ms);
                self.send_to_peer(&mut out, peer, msg.clone());
            }
            out.arm(
                self.timer,
                Some(self.timings.GM_AYC_RESPONSE_TIMEOUT),
                GmTask::Premerge,
            );
        }
        out
    }

    /// Collect AYC results: drop silent members, then back off before
    /// merging with the other coordinators found.
    fn premerge(&mut self, _completion: Completion, _now_ms: u64) -> GmOutput {
        if !self.is_coordinator() {
            return GmOutput::empty();
        }
        let mut out = GmOutput::empty();
        let mut list_change = false;
        let silent: Vec<NodeId> = self.ayc_expected.keys().cloned().collect();
        for peer in silent {
            if self.up_nodes.remove(&peer) {
                info!("no response from peer: {peer}");
                list_change = true;
            }
        }
        if list_change {
            out.merge(self.push_peer_list());
        }
        self.ayc_expected.clear();
        if !self.coordinators.is_empty() {
            self.elections_started += 1;
            // The smallest identifier merges first; everyone else slots in
            // behind it, which is the tiebreak that makes elections
            // converge on the lexicographically smallest coordinator.
            let lower_ranked = self
                .coordinators
                .iter()
                .filter(|peer| **peer < self.me)
                .count() as u64;
            let wait_ms = if lower_ranked == 0 {
                0
            } else {
                let max = self.timings.GM_PREMERGE_MAX_TIMEOUT;
                let min = self.timings.GM_PREMERGE_MIN_TIMEOUT;
                let granularity = self.timings.GM_PREMERGE_GRANULARITY.max(1);
                let delta = (max.saturating_sub(min)) / granularity;
                min + (lower_ranked % (granularity + 1)) * delta
            };
            info!("timer: waiting for merge: {wait_ms} ms");
            out.arm(self.timer, Some(wait_ms), GmTask::Merge);
        } else {
            out.arm(self.timer, Some(self.timings.GM_CHECK_TIMEOUT), GmTask::Check);
        }
        out
    }

    /// Form a new group: invite the coordinators we found and our old
    /// members, then wait for accepts.
    fn merge(&mut self, completion: Completion, now_ms: u64) -> GmOutput {
        if completion == Completion::Cancelled {
            return GmOutput::empty();
        }
        if !self.is_coordinator() {
            // Accepted someone else's invitation during the premerge wait.
            info!("skipping merge: no longer a coordinator");
            return GmOutput::empty();
        }
        self.role = Role::Election;
        info!("+ state change ELECTION (merge)");
        self.group_counter += 1;
        self.group_id = self.group_counter;
        self.leader = self.me.clone();
        info!("changed group: {} ({})", self.group_id, self.leader);
        let old_members = std::mem::take(&mut self.up_nodes);
        let invite = self.invitation(now_ms);
        let mut out = GmOutput::empty();
        info!("send: sending out invites (coordinators)");
        let coordinators: Vec<NodeId> = self
            .coordinators
            .iter()
            .filter(|id| **id != self.me)
            .cloned()
            .collect();
        for peer in coordinators {
            self.send_to_peer(&mut out, peer, invite.clone());
        }
        info!("send: sending out invites (old group)");
        for peer in old_members {
            if peer != self.me {
                self.send_to_peer(&mut out, peer, invite.clone());
            }
        }
        out.arm(
            self.timer,
            Some(self.timings.GM_INVITE_RESPONSE_TIMEOUT),
            GmTask::Reorganize,
        );
        out
    }

    /// Invitation window closed: publish the membership and go to work.
    fn reorganize(&mut self, completion: Completion, _now_ms: u64) -> GmOutput {
        if completion == Completion::Cancelled {
            return GmOutput::empty();
        }
        self.role = Role::Reorganization;
        info!("+ state change REORGANIZATION (reorganize)");
        let mut out = self.push_peer_list();
        self.role = Role::Normal;
        self.groups_formed += 1;
        info!(
            "+ state change NORMAL (reorganize), members: {}",
            self.up_nodes.len()
        );
        out.arm(self.timer, Some(self.timings.GM_CHECK_TIMEOUT), GmTask::Check);
        out
    }

    /// Member steady state: probe the coordinator.
    fn timeout(&mut self, completion: Completion, now_ms: u64) -> GmOutput {
        if completion == Completion::Cancelled {
            return GmOutput::empty();
        }
        self.log_system_state();
        let mut out = GmOutput::empty();
        if !self.is_coordinator() {
            let msg = self.are_you_there(now_ms);
            self.ayt_expected.clear();
            let coordinator = self.leader.clone();
            info!("send: sending AreYouThere to {coordinator}");
            self.ayt_expected.insert(coordinator.clone(), now_ms);
            self.send_to_peer(&mut out, coordinator, msg);
            out.arm(
                self.timer,
                Some(self.timings.GM_AYT_RESPONSE_TIMEOUT),
                GmTask::Recovery,
            );
        }
        out
    }

    /// Poll the FID state; when every attached FID reads open the node
    /// stops answering peers and rebuilds solo once they close again.
    fn fid_check(&mut self, completion: Completion, devices: &dyn DeviceIndex) -> GmOutput {
        if completion == Completion::Cancelled {
            return GmOutput::empty();
        }
        let attached = devices.count_of_type("Fid");
        let state = devices.net_value("Fid", "state");
        let mut out = GmOutput::empty();
        if self.fids_closed && attached > 0 && state == 0.0 {
            info!("all FIDs offline, entering recovery state");
            out.merge(self.recovery(0));
            self.fids_closed = false;
        } else if !self.fids_closed && attached > 0 && state > 0.0 {
            info!("all FIDs online, checking for peers");
            self.fids_closed = true;
        }
        out.arm(
            self.fid_timer,
            Some(self.timings.GM_FID_TIMEOUT),
            GmTask::FidCheck,
        );
        out
    }

    // ── Message handling ────────────────────────────────────────────────

    /// Handle a delivered message addressed to this module.
    pub fn handle(&mut self, msg: &Message, from: &NodeId, now_ms: u64) -> GmOutput {
        // With the FIDs open this node is electrically islanded; it
        // neither answers nor tracks peers.
        if !self.fids_closed {
            debug!("dropping message, all FIDs open");
            return GmOutput::empty();
        }
        match msg.handler.as_str() {
            "any.PeerList" => self.handle_peer_list(msg, from),
            "gm.Invite" => self.handle_invite(msg, from, now_ms),
            "gm.Accept" => self.handle_accept(msg, from),
            "gm.AreYouCoordinator" => self.handle_ayc(msg, from, now_ms),
            "gm.Response.AreYouCoordinator" => self.handle_response_ayc(msg, from),
            "gm.AreYouThere" => self.handle_ayt(msg, from, now_ms),
            "gm.Response.AreYouThere" => self.handle_response_ayt(msg, from),
            "gm.PeerListQuery" => self.handle_peer_list_query(msg, from),
            other => {
                if other.starts_with("gm") {
                    warn!("unhandled group management message '{other}'");
                }
                GmOutput::empty()
            }
        }
    }

    fn handle_peer_list(&mut self, msg: &Message, from: &NodeId) -> GmOutput {
        let mut out = GmOutput::empty();
        if *from != self.leader {
            return out;
        }
        let peers = process_peer_list(msg);
        match self.role {
            Role::Reorganization => {
                self.role = Role::Normal;
                info!("+ state change NORMAL (peer list)");
                self.groups_joined += 1;
                // Displace whatever countdown is pending and resume the
                // member probe loop.
                out.arm(
                    self.timer,
                    Some(self.timings.GM_TIMEOUT_TIMEOUT),
                    GmTask::Timeout,
                );
                self.adopt_peer_list(&peers, &mut out);
                info!("recv: PeerList (ready) from {from}");
            }
            Role::Normal => {
                self.adopt_peer_list(&peers, &mut out);
                debug!("updated peer set from {from}");
            }
            _ => {}
        }
        out
    }

    fn adopt_peer_list(&mut self, peers: &[(NodeId, RemoteHost)], out: &mut GmOutput) {
        self.up_nodes.clear();
        for (id, host) in peers {
            self.known.insert(id.clone(), host.clone());
            out.hosts.push((id.clone(), host.clone()));
            if *id != self.me {
                self.up_nodes.insert(id.clone());
            }
        }
    }

    fn handle_invite(&mut self, msg: &Message, from: &NodeId, now_ms: u64) -> GmOutput {
        let mut out = GmOutput::empty();
        info!("recv: invite from {from}");
        if self.role != Role::Normal {
            // Not accepting invitations outside normal operation.
            return out;
        }
        let Some(group_id) = msg.sub.get_parsed::<u64>("gm.groupid") else {
            return out;
        };
        let Some(new_leader) = msg.sub.get("gm.groupleader").map(NodeId::from) else {
            return out;
        };
        let was_coordinator = self.is_coordinator();
        let old_members = self.up_nodes.clone();
        self.role = Role::Election;
        info!("+ state change ELECTION (invite)");
        self.group_id = group_id;
        self.leader = new_leader.clone();
        info!("changed group: {group_id} ({new_leader})");
        if was_coordinator {
            // Forward the invitation to my old group so they follow.
            info!("send: forwarding invitations to former group members");
            let mut forward = msg.clone();
            forward.sub.put("gm.source", self.leader.as_str());
            for peer in old_members {
                if peer != self.me {
                    self.send_to_peer(&mut out, peer, forward.clone());
                }
            }
        }
        // Register the leader's address if this is first contact (the
        // invite may have been forwarded by someone else).
        if !self.known.contains_key(&new_leader) {
            if let (Some(host), Some(port)) = (
                msg.sub.get("gm.groupleaderhost"),
                msg.sub.get_parsed::<u16>("gm.groupleaderport"),
            ) {
                let host = RemoteHost::new(host, port);
                self.known.insert(new_leader.clone(), host.clone());
                out.hosts.push((new_leader.clone(), host));
            }
        }
        info!("send: invitation accept to {new_leader}");
        let accept = self.accept(now_ms);
        self.send_to_peer(&mut out, new_leader, accept);
        self.role = Role::Reorganization;
        info!("+ state change REORGANIZATION (invite)");
        out.arm(
            self.timer,
            Some(self.timings.GM_TIMEOUT_TIMEOUT),
            GmTask::Recovery,
        );
        out
    }

    fn handle_accept(&mut self, msg: &Message, from: &NodeId) -> GmOutput {
        let group = msg.sub.get_parsed::<u64>("gm.groupid");
        info!("recv: accept from {from}");
        if self.role == Role::Election && group == Some(self.group_id) && self.is_coordinator() {
            self.up_nodes.insert(from.clone());
        } else {
            warn!("unexpected accept message from {from}");
        }
        GmOutput::empty()
    }

    fn handle_ayc(&mut self, msg: &Message, from: &NodeId, now_ms: u64) -> GmOutput {
        let seq = msg.sub.get_parsed::<u64>("gm.seq").unwrap_or(0);
        info!("recv: AreYouCoordinator from {from} seq {seq}");
        let yes = self.role == Role::Normal && self.is_coordinator();
        let payload = if yes { "yes" } else { "no" };
        info!("send: AYC response ({payload}) to {from}");
        let resp = self.response(payload, "AreYouCoordinator", msg.expires, seq, now_ms);
        let mut out = GmOutput::empty();
        self.send_to_peer(&mut out, from.clone(), resp);
        out
    }

    fn handle_ayt(&mut self, msg: &Message, from: &NodeId, now_ms: u64) -> GmOutput {
        let seq = msg.sub.get_parsed::<u64>("gm.seq").unwrap_or(0);
        let group = msg.sub.get_parsed::<u64>("gm.groupid");
        info!("recv: AreYouThere from {from} seq {seq}");
        let yes = self.is_coordinator()
            && group == Some(self.group_id)
            && self.up_nodes.contains(from);
        let payload = if yes { "yes" } else { "no" };
        info!("send: AYT response ({payload}) to {from}");
        let resp = self.response(payload, "AreYouThere", msg.expires, seq, now_ms);
        let mut out = GmOutput::empty();
        self.send_to_peer(&mut out, from.clone(), resp);
        out
    }

    fn handle_response_ayc(&mut self, msg: &Message, from: &NodeId) -> GmOutput {
        let answer = msg.sub.get("gm.payload").unwrap_or("");
        info!("recv: response (AYC) ({answer}) from {from}");
        let expected = self.ayc_expected.remove(from).is_some();
        let mut out = GmOutput::empty();
        if expected && answer == "yes" {
            self.coordinators.insert(from.clone());
            if self.ayc_expected.is_empty() {
                // Everyone answered early; skip the rest of the wait.
                out.arm(
                    self.timer,
                    Some(self.timings.GM_TIMEOUT_TIMEOUT),
                    GmTask::Check,
                );
            }
        } else if answer == "no" {
            // The responder follows some other coordinator; learn about it.
            if let (Some(uuid), Some(host), Some(port)) = (
                msg.sub.get("gm.ldruuid"),
                msg.sub.get("gm.ldrhost"),
                msg.sub.get_parsed::<u16>("gm.ldrport"),
            ) {
                let leader = NodeId::from(uuid);
                let host = RemoteHost::new(host, port);
                self.known.insert(leader.clone(), host.clone());
                out.hosts.push((leader, host));
            }
            self.coordinators.remove(from);
        } else {
            warn!("unsolicited AreYouCoordinator response from {from}");
        }
        out
    }

    fn handle_response_ayt(&mut self, msg: &Message, from: &NodeId) -> GmOutput {
        let answer = msg.sub.get("gm.payload").unwrap_or("");
        info!("recv: response (AYT) ({answer}) from {from}");
        let expected = self.ayt_expected.remove(from).is_some();
        let mut out = GmOutput::empty();
        if expected && answer == "yes" {
            out.arm(
                self.timer,
                Some(self.timings.GM_TIMEOUT_TIMEOUT),
                GmTask::Timeout,
            );
        } else if answer == "no" {
            if *from == self.leader {
                // We've been dropped from the group.
                out.merge(self.recovery(0));
            }
        } else {
            warn!("unsolicited AreYouThere response from {from}");
        }
        out
    }

    fn handle_peer_list_query(&mut self, msg: &Message, from: &NodeId) -> GmOutput {
        let requester = msg.sub.get("gm.requester").unwrap_or("any").to_string();
        let mut out = GmOutput::empty();
        let list = self.peer_list(&requester);
        self.send_to_peer(&mut out, from.clone(), list);
        out
    }

    // ── Message builders ────────────────────────────────────────────────

    fn are_you_coordinator(&mut self, now_ms: u64) -> Message {
        let mut msg = Message::new("gm.AreYouCoordinator");
        msg.sub.put("gm.source", self.me.as_str());
        msg.sub.put("gm.seq", self.next_seq().to_string());
        msg.expire_from(now_ms, self.timings.GM_GLOBAL_TIMEOUT);
        msg
    }

    fn are_you_there(&mut self, now_ms: u64) -> Message {
        let mut msg = Message::new("gm.AreYouThere");
        msg.sub.put("gm.source", self.me.as_str());
        msg.sub.put("gm.groupid", self.group_id.to_string());
        msg.sub.put("gm.groupleader", self.leader.as_str());
        msg.sub.put("gm.seq", self.next_seq().to_string());
        msg.expire_from(now_ms, self.timings.GM_GLOBAL_TIMEOUT);
        msg
    }

    fn invitation(&self, now_ms: u64) -> Message {
        let mut msg = Message::new("gm.Invite");
        msg.sub.put("gm.source", self.leader.as_str());
        msg.sub.put("gm.groupid", self.group_id.to_string());
        msg.sub.put("gm.groupleader", self.leader.as_str());
        if let Some(host) = self.known.get(&self.leader) {
            msg.sub.put("gm.groupleaderhost", host.hostname.as_str());
            msg.sub.put("gm.groupleaderport", host.port.to_string());
        }
        msg.expire_from(now_ms, self.timings.GM_GLOBAL_TIMEOUT);
        msg
    }

    fn accept(&self, now_ms: u64) -> Message {
        let mut msg = Message::new("gm.Accept");
        msg.sub.put("gm.source", self.me.as_str());
        msg.sub.put("gm.groupid", self.group_id.to_string());
        msg.sub.put("gm.groupleader", self.leader.as_str());
        msg.expire_from(now_ms, self.timings.GM_GLOBAL_TIMEOUT);
        msg
    }

    fn response(
        &self,
        payload: &str,
        kind: &str,
        expires: Expiry,
        seq: u64,
        _now_ms: u64,
    ) -> Message {
        let mut msg = Message::new(format!("gm.Response.{kind}"));
        msg.sub.put("gm.source", self.me.as_str());
        msg.sub.put("gm.payload", payload);
        msg.sub.put("gm.ldruuid", self.leader.as_str());
        if let Some(host) = self.known.get(&self.leader) {
            msg.sub.put("gm.ldrhost", host.hostname.as_str());
            msg.sub.put("gm.ldrport", host.port.to_string());
        }
        msg.sub.put("gm.seq", seq.to_string());
        msg.expires = expires;
        msg
    }

    /// The membership message. The coordinator includes itself in the
    /// list; `requester` prefixes the handler so any module can ask.
    pub fn peer_list(&self, requester: &str) -> Message {
        let mut msg = Message::new(format!("{requester}.PeerList"));
        msg.sub.put("any.source", self.me.as_str());
        msg.sub.put("any.coordinator", self.leader.as_str());
        for peer in self.up_nodes.iter().chain(std::iter::once(&self.me)) {
            let mut entry = SubTree::new();
            entry.add("uuid", peer.as_str());
            if let Some(host) = self.known.get(peer) {
                entry.add("host", host.hostname.as_str());
                entry.add("port", host.port.to_string());
            }
            msg.sub.add_child("any.peers.peer", entry);
        }
        msg.never_expires();
        msg
    }

    /// A query another module can send to fetch the group from any node.
    pub fn peer_list_query(requester: &str) -> Message {
        let mut msg = Message::new("gm.PeerListQuery");
        msg.sub.put("gm.requester", requester);
        msg
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn next_seq(&mut self) -> u64 {
        self.probe_seq += 1;
        self.probe_seq
    }

    /// Send the membership to every member and to this node's own modules.
    fn push_peer_list(&mut self) -> GmOutput {
        let msg = self.peer_list("any");
        let mut out = GmOutput::empty();
        let members: Vec<NodeId> = self.up_nodes.iter().cloned().collect();
        for peer in members {
            debug!("send group list to {peer}");
            self.send_to_peer(&mut out, peer, msg.clone());
        }
        out.send(self.me.clone(), msg);
        out
    }

    /// All sends are gated on the FID state.
    fn send_to_peer(&self, out: &mut GmOutput, peer: NodeId, msg: Message) {
        if self.fids_closed {
            out.send(peer, msg);
        } else {
            debug!("message not sent (FIDs open)");
        }
    }

    fn log_system_state(&self) {
        info!(
            "system state: me {} group {} leader {} members {:?} \
             formed {} broken {} elections {} joined {}",
            self.me,
            self.group_id,
            self.leader,
            self.up_nodes,
            self.groups_formed,
            self.groups_broken,
            self.elections_started,
            self.groups_joined,
        );
    }
}

/// Decode the peer entries of a `PeerList` message.
pub fn process_peer_list(msg: &Message) -> Vec<(NodeId, RemoteHost)> {
    let mut peers = Vec::new();
    let Some(list) = msg.sub.get_child("any.peers") else {
        return peers;
    };
    for entry in list.trees("peer") {
        let Some(uuid) = entry.get("uuid") else {
            continue;
        };
        let host = entry.get("host").unwrap_or("");
        let port = entry.get_parsed::<u16>("port").unwrap_or(0);
        peers.push((NodeId::from(uuid), RemoteHost::new(host, port)));
    }
    peers
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceTable;

    fn agent(name: &str) -> GmAgent {
        GmAgent::new(
            NodeId::from(name),
            RemoteHost::new(name.split(':').next().unwrap(), 1870),
            Timings::dev_default(),
            0,
            1,
        )
    }

    fn hosts(names: &[&str]) -> Vec<(NodeId, RemoteHost)> {
        names
            .iter()
            .map(|n| {
                (
                    NodeId::from(*n),
                    RemoteHost::new(n.split(':').next().unwrap(), 1870),
                )
            })
            .collect()
    }

    #[test]
    fn test_run_forms_solo_group() {
        let mut gm = agent("x:1870");
        let out = gm.run(&hosts(&["y:1870", "z:1870"]), 1_000);
        assert!(gm.is_coordinator());
        assert_eq!(gm.role(), Role::Normal);
        assert!(gm.members().is_empty());
        // A peer list goes to this node's own modules, and timers are set
        // for both the check loop and the FID poll.
        assert!(out.sends.iter().any(|(to, m)| *to == NodeId::from("x:1870")
            && m.handler == "any.PeerList"));
        assert_eq!(out.timers.len(), 2);
    }

    #[test]
    fn test_check_probes_all_known_peers() {
        let mut gm = agent("x:1870");
        gm.run(&hosts(&["y:1870", "z:1870"]), 1_000);
        let out = gm.on_task(
            GmTask::Check,
            Completion::Normal,
            2_000,
            &DeviceTable::new(),
        );
        let targets: Vec<&str> = out
            .sends
            .iter()
            .filter(|(_, m)| m.handler == "gm.AreYouCoordinator")
            .map(|(to, _)| to.as_str())
            .collect();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&"y:1870") && targets.contains(&"z:1870"));
        // Premerge follows after the response window.
        assert!(out
            .timers
            .iter()
            .any(|t| t.task == GmTask::Premerge && t.wait_ms.is_some()));
    }

    #[test]
    fn test_ayc_response_yes_only_from_normal_coordinator() {
        let mut gm = agent("x:1870");
        gm.run(&[], 1_000);
        let mut ayc = Message::new("gm.AreYouCoordinator");
        ayc.sub.put("gm.seq", "1");
        let from = NodeId::from("y:1870");
        let out = gm.handle(&ayc, &from, 2_000);
        let (_, resp) = &out.sends[0];
        assert_eq!(resp.handler, "gm.Response.AreYouCoordinator");
        assert_eq!(resp.sub.get("gm.payload"), Some("yes"));
        // A non-coordinator answers no and names its leader.
        gm.leader = NodeId::from("w:1870");
        let out = gm.handle(&ayc, &from, 2_001);
        let (_, resp) = &out.sends[0];
        assert_eq!(resp.sub.get("gm.payload"), Some("no"));
        assert_eq!(resp.sub.get("gm.ldruuid"), Some("w:1870"));
    }

    #[test]
    fn test_smallest_coordinator_merges_first() {
        let mut small = agent("x:1870");
        small.run(&hosts(&["y:1870"]), 1_000);
        small.coordinators.insert(NodeId::from("y:1870"));
        let out = small.on_task(
            GmTask::Premerge,
            Completion::Normal,
            2_000,
            &DeviceTable::new(),
        );
        let merge_wait = out
            .timers
            .iter()
            .find(|t| t.task == GmTask::Merge)
            .unwrap()
            .wait_ms
            .unwrap();
        assert_eq!(merge_wait, 0, "lex-smallest waits zero");

        let mut big = agent("y:1870");
        big.run(&hosts(&["x:1870"]), 1_000);
        big.coordinators.insert(NodeId::from("x:1870"));
        let out = big.on_task(
            GmTask::Premerge,
            Completion::Normal,
            2_000,
            &DeviceTable::new(),
        );
        let merge_wait = out
            .timers
            .iter()
            .find(|t| t.task == GmTask::Merge)
            .unwrap()
            .wait_ms
            .unwrap();
        assert!(merge_wait > 0, "larger identifier backs off");
    }

    #[test]
    fn test_merge_invites_and_accept_joins() {
        let mut x = agent("x:1870");
        x.run(&hosts(&["y:1870"]), 1_000);
        x.coordinators.insert(NodeId::from("y:1870"));
        let out = x.on_task(GmTask::Merge, Completion::Normal, 2_000, &DeviceTable::new());
        let invite = out
            .sends
            .iter()
            .find(|(_, m)| m.handler == "gm.Invite")
            .map(|(_, m)| m.clone())
            .expect("invitation sent");
        assert_eq!(x.role(), Role::Election);

        // y accepts the invitation and reorganizes under x.
        let mut y = agent("y:1870");
        y.run(&hosts(&["x:1870"]), 1_000);
        let out = y.handle(&invite, &NodeId::from("x:1870"), 2_001);
        assert_eq!(y.coordinator(), &NodeId::from("x:1870"));
        assert_eq!(y.role(), Role::Reorganization);
        let accept = out
            .sends
            .iter()
            .find(|(_, m)| m.handler == "gm.Accept")
            .map(|(_, m)| m.clone())
            .expect("accept sent");

        // x records the accept and publishes the group on reorganize.
        x.handle(&accept, &NodeId::from("y:1870"), 2_002);
        assert!(x.members().contains(&NodeId::from("y:1870")));
        let out = x.on_task(
            GmTask::Reorganize,
            Completion::Normal,
            2_003,
            &DeviceTable::new(),
        );
        assert_eq!(x.role(), Role::Normal);
        let peer_list = out
            .sends
            .iter()
            .find(|(to, m)| m.handler == "any.PeerList" && *to == NodeId::from("y:1870"))
            .map(|(_, m)| m.clone())
            .expect("peer list pushed to member");
        let peers = process_peer_list(&peer_list);
        let ids: Vec<&str> = peers.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"x:1870") && ids.contains(&"y:1870"));

        // y adopts the membership and returns to normal.
        y.handle(&peer_list, &NodeId::from("x:1870"), 2_004);
        assert_eq!(y.role(), Role::Normal);
        assert!(y.members().contains(&NodeId::from("x:1870")));
    }

    #[test]
    fn test_ayt_no_from_leader_triggers_recovery() {
        let mut y = agent("y:1870");
        y.run(&hosts(&["x:1870"]), 1_000);
        y.leader = NodeId::from("x:1870");
        y.ayt_expected.insert(NodeId::from("x:1870"), 1_000);
        let mut resp = Message::new("gm.Response.AreYouThere");
        resp.sub.put("gm.payload", "no");
        y.handle(&resp, &NodeId::from("x:1870"), 2_000);
        assert!(y.is_coordinator(), "dropped member rebuilds solo");
    }

    #[test]
    fn test_silent_member_pruned_at_premerge() {
        let mut x = agent("x:1870");
        x.run(&hosts(&["y:1870"]), 1_000);
        x.up_nodes.insert(NodeId::from("y:1870"));
        x.ayc_expected.insert(NodeId::from("y:1870"), 1_500);
        let out = x.on_task(
            GmTask::Premerge,
            Completion::Normal,
            2_000,
            &DeviceTable::new(),
        );
        assert!(x.members().is_empty());
        // The shrunken membership is pushed out.
        assert!(out.sends.iter().any(|(_, m)| m.handler == "any.PeerList"));
    }

    #[test]
    fn test_fid_gate_drops_messages_and_recovers() {
        let mut gm = agent("x:1870");
        gm.run(&hosts(&["y:1870"]), 1_000);
        let mut fids = DeviceTable::new();
        fids.add("fid1", "Fid", "state", 0.0);
        // All FIDs open: enter recovery and stop answering.
        gm.on_task(GmTask::FidCheck, Completion::Normal, 2_000, &fids);
        let mut ayc = Message::new("gm.AreYouCoordinator");
        ayc.sub.put("gm.seq", "1");
        let out = gm.handle(&ayc, &NodeId::from("y:1870"), 2_100);
        assert!(out.sends.is_empty(), "no replies while islanded");
        // FIDs close again: service resumes.
        fids.set_signal("fid1", "state", 1.0);
        gm.on_task(GmTask::FidCheck, Completion::Normal, 2_200, &fids);
        let out = gm.handle(&ayc, &NodeId::from("y:1870"), 2_300);
        assert!(!out.sends.is_empty());
    }

    #[test]
    fn test_recovery_cancelled_schedules_member_probe() {
        let mut y = agent("y:1870");
        y.run(&hosts(&["x:1870"]), 1_000);
        y.leader = NodeId::from("x:1870");
        let out = y.on_task(
            GmTask::Recovery,
            Completion::Cancelled,
            2_000,
            &DeviceTable::new(),
        );
        assert!(out
            .timers
            .iter()
            .any(|t| t.task == GmTask::Timeout));
    }

    #[test]
    fn test_peer_list_query_answered_for_requester() {
        let mut x = agent("x:1870");
        x.run(&[], 1_000);
        let query = GmAgent::peer_list_query("lb");
        let out = x.handle(&query, &NodeId::from("y:1870"), 2_000);
        let (_, resp) = &out.sends[0];
        assert_eq!(resp.handler, "lb.PeerList");
    }
}
