//! State collection: Chandy–Lamport distributed snapshots.
//!
//! A requesting module asks for a consistent global reading of named
//! device signals. The initiator snapshots its own devices, tags the cut
//! with a version `(initiator, counter)`, and floods a marker. A peer
//! snapshots on its first marker, forwards the marker to every other
//! member (the echo back to the sender is what lets the initiator count
//! a marker per incoming channel), and records every non-snapshot
//! message that arrives while the cut is open — those are the in-channel
//! messages of the cut. A node that has counted markers for every
//! incoming channel closes its cut; peers send their recordings back to
//! the initiator, and the initiator assembles the response keyed by
//! device type.
//!
//! Because the reliable protocol delivers per-channel in FIFO order and
//! markers precede any post-snapshot traffic, the union of pre-marker
//! local states and recorded channel messages is a consistent cut.

use {
    crate::{devices::DeviceIndex, group::process_peer_list, Output},
    dgi_core::{Message, NodeId, SubTree},
    log::{debug, info, warn},
    std::collections::BTreeSet,
};

/// Snapshot version: the initiator and its marker counter.
pub type StateVersion = (NodeId, u64);

/// Tasks the snapshot agent queues on its own phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScTask {
    /// Begin a collection cycle for the pending request.
    Initiate,
}

/// Convenience alias for this agent's transition output.
pub type ScOutput = Output<ScTask>;

/// The state-collection agent.
pub struct ScAgent {
    me: NodeId,
    /// Current group (me included), refreshed by `PeerList`.
    peers: BTreeSet<NodeId>,
    /// Who pushes the peer list; authoritative on version conflicts.
    leader: NodeId,
    /// The in-flight snapshot version, if a cut is open.
    version: Option<StateVersion>,
    /// Our own marker counter, monotone per initiated snapshot.
    counter: u64,
    /// True while channel messages are being recorded.
    recording: bool,
    markers_seen: usize,
    states_received: usize,
    /// Collected `(version, state)` records, local and remote.
    collected: Vec<(StateVersion, SubTree)>,
    /// Device queries of the current request, as `Type:signal`.
    device_list: Vec<String>,
    /// Module that asked for the collection.
    module: String,
}

impl ScAgent {
    /// Create the agent for the node named `me`.
    pub fn new(me: NodeId) -> Self {
        ScAgent {
            leader: me.clone(),
            peers: BTreeSet::from([me.clone()]),
            me,
            version: None,
            counter: 0,
            recording: false,
            markers_seen: 0,
            states_received: 0,
            collected: Vec::new(),
            device_list: Vec::new(),
            module: String::new(),
        }
    }

    /// True while a cut is open and channel traffic is being recorded.
    pub fn recording(&self) -> bool {
        self.recording
    }

    /// The in-flight snapshot version.
    pub fn version(&self) -> Option<&StateVersion> {
        self.version.as_ref()
    }

    /// Number of state records currently held (tests and logging).
    pub fn collected_len(&self) -> usize {
        self.collected.len()
    }

    // ── Scheduled tasks ─────────────────────────────────────────────────

    /// Run a task queued on the `sc` phase.
    pub fn on_task(&mut self, task: ScTask, devices: &dyn DeviceIndex) -> ScOutput {
        match task {
            ScTask::Initiate => self.initiate(devices),
        }
    }

    /// Initiator: record the local state and flood the marker.
    fn initiate(&mut self, devices: &dyn DeviceIndex) -> ScOutput {
        self.collected.clear();
        self.states_received = 0;
        self.counter += 1;
        let version = (self.me.clone(), self.counter);
        self.version = Some(version.clone());
        self.markers_seen = 1;
        info!("taking snapshot: collecting states of {}", self.me);
        let state = self.take_snapshot(devices);
        self.collected.push((version, state));
        if self.peers.len() > 1 {
            self.recording = true;
        }
        let marker = self.marker();
        let mut out = ScOutput::empty();
        for peer in &self.peers {
            if *peer != self.me {
                info!("sending marker to {peer}");
                out.send(peer.clone(), marker.clone());
            }
        }
        // A solo group completes immediately.
        if self.peers.len() == 1 {
            out.merge(self.state_response());
        }
        out
    }

    // ── Message handling ────────────────────────────────────────────────

    /// Handle a delivered message addressed to this module.
    pub fn handle(
        &mut self,
        msg: &Message,
        from: &NodeId,
        devices: &dyn DeviceIndex,
    ) -> ScOutput {
        match msg.handler.as_str() {
            "any.PeerList" => self.handle_peer_list(msg, from),
            "sc.request" => self.handle_request(msg, from),
            "sc.marker" => self.handle_marker(msg, from, devices),
            "sc.state" => self.handle_state(msg, from),
            other => {
                if other.starts_with("sc") {
                    warn!("unhandled state collection message '{other}'");
                    return ScOutput::empty();
                }
                self.record_in_transit(msg, from)
            }
        }
    }

    /// Every non-snapshot message that arrives while the cut is open is
    /// part of some channel's in-flight state.
    fn record_in_transit(&mut self, msg: &Message, from: &NodeId) -> ScOutput {
        if !self.recording || !self.peers.contains(from) {
            return ScOutput::empty();
        }
        let Some(version) = self.version.clone() else {
            return ScOutput::empty();
        };
        info!("recording in-transit message: {}", msg.handler);
        let mut state = SubTree::new();
        state.put("sc.source", self.me.as_str());
        let mut record = SubTree::new();
        record.add("type", "Message");
        record.add("signal", "inchannel");
        record.add(
            "value",
            format!("{} from {} to {}", msg.handler, from, self.me),
        );
        record.add("count", "1");
        state.add_child("sc.collects.collect", record);
        self.collected.push((version, state));
        ScOutput::empty()
    }

    /// Membership changed: an in-flight snapshot is no longer collectible
    /// unless we lead it ourselves.
    fn handle_peer_list(&mut self, msg: &Message, from: &NodeId) -> ScOutput {
        self.leader = from.clone();
        self.peers = process_peer_list(msg)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        info!("peer list received from group leader {from}");
        if self.peers.len() == 1 {
            self.recording = false;
        }
        let initiated_by_me = matches!(&self.version, Some((initiator, _)) if *initiator == self.me);
        if *from == self.me && initiated_by_me {
            debug!("own collection in progress, keep going");
        } else {
            self.version = None;
            self.collected.clear();
            self.recording = false;
            self.markers_seen = 0;
            self.states_received = 0;
        }
        ScOutput::empty()
    }

    /// A module asked for a collection: note the query and queue the
    /// initiation at the back of this phase's work queue.
    fn handle_request(&mut self, msg: &Message, from: &NodeId) -> ScOutput {
        if !self.peers.contains(from) {
            return ScOutput::empty();
        }
        let Some(module) = msg.sub.get("sc.module") else {
            warn!("collection request without a requesting module");
            return ScOutput::empty();
        };
        self.module = module.to_string();
        self.device_list.clear();
        if let Some(devices) = msg.sub.get_child("sc.devices") {
            for entry in devices.trees("device") {
                if let (Some(dtype), Some(signal)) =
                    (entry.get("deviceType"), entry.get("valueType"))
                {
                    self.device_list.push(format!("{dtype}:{signal}"));
                }
            }
        }
        info!(
            "received state collect request from {} module ({from})",
            self.module
        );
        let mut out = ScOutput::empty();
        out.queue.push(ScTask::Initiate);
        out
    }

    /// Marker reception: open, advance, or supersede the cut.
    fn handle_marker(
        &mut self,
        msg: &Message,
        from: &NodeId,
        devices: &dyn DeviceIndex,
    ) -> ScOutput {
        if !self.peers.contains(from) {
            return ScOutput::empty();
        }
        let Some(initiator) = msg.sub.get("sc.source").map(NodeId::from) else {
            return ScOutput::empty();
        };
        let Some(id) = msg.sub.get_parsed::<u64>("sc.id") else {
            return ScOutput::empty();
        };
        let incoming: StateVersion = (initiator, id);
        self.device_list = msg
            .sub
            .get_child("sc.devices")
            .map(|d| d.leaves("device").map(str::to_string).collect())
            .unwrap_or_default();

        match &self.version {
            None => {
                debug!("first marker, opening cut {incoming:?}");
                self.save_forward(incoming, msg, from, devices)
            }
            Some(current) if *current == incoming && incoming.0 == self.me => {
                // Initiator observed a marker echo on another channel.
                self.markers_seen += 1;
                if self.markers_seen == self.peers.len() {
                    self.recording = false;
                }
                ScOutput::empty()
            }
            Some(current) if *current == incoming => {
                // Peer observed another channel's marker.
                self.markers_seen += 1;
                if self.markers_seen == self.peers.len() - 1 {
                    self.recording = false;
                    let out = self.send_state_back();
                    self.reset_cut();
                    return out;
                }
                ScOutput::empty()
            }
            Some(current) => {
                let current = current.clone();
                // Conflicting cut: the leader is authoritative, and a
                // fresher counter from the same initiator supersedes.
                let same_initiator_newer = incoming.0 == current.0 && incoming.1 > current.1;
                let from_leader = incoming.0 == self.leader && current.0 != self.leader;
                let leader_newer = incoming.0 == self.leader && incoming.1 > current.1;
                if same_initiator_newer || from_leader || leader_newer {
                    info!("superseding cut {current:?} with {incoming:?}");
                    self.save_forward(incoming, msg, from, devices)
                } else {
                    debug!("ignoring marker {incoming:?} (current {current:?})");
                    ScOutput::empty()
                }
            }
        }
    }

    /// Save the local state for a newly adopted cut and forward the
    /// marker to every other member, the sender included — the echo is
    /// what advances the marker count on the reverse channel.
    fn save_forward(
        &mut self,
        version: StateVersion,
        marker: &Message,
        _from: &NodeId,
        devices: &dyn DeviceIndex,
    ) -> ScOutput {
        self.collected.clear();
        self.version = Some(version.clone());
        self.markers_seen = 1;
        info!("marker is {} {}", version.0, version.1);
        debug!("{} physical devices on this node", devices.device_count());
        let state = self.take_snapshot(devices);
        self.collected.push((version.clone(), state));

        let mut out = ScOutput::empty();
        if self.peers.len() == 2 {
            // Two-node fast path: every channel has now been observed;
            // echo the marker and ship the state straight back.
            out.send(version.0.clone(), marker.clone());
            out.merge(self.send_state_back());
            self.reset_cut();
        } else {
            for peer in &self.peers {
                if *peer != self.me {
                    info!("forwarding marker to {peer}");
                    out.send(peer.clone(), marker.clone());
                }
            }
            self.recording = true;
        }
        out
    }

    /// Peer: package the collected records for the initiator.
    fn send_state_back(&mut self) -> ScOutput {
        let Some((initiator, id)) = self.version.clone() else {
            return ScOutput::empty();
        };
        info!(
            "sending {} collected states back to {initiator}",
            self.collected.len()
        );
        let mut msg = Message::new("sc.state");
        msg.sub.put("sc.source", self.me.as_str());
        msg.sub.put("sc.marker.uuid", initiator.as_str());
        msg.sub.put("sc.marker.int", id.to_string());
        let version = (initiator.clone(), id);
        for (v, state) in &self.collected {
            if *v != version {
                continue;
            }
            if let Some(collects) = state.get_child("sc.collects") {
                for record in collects.trees("collect") {
                    msg.sub.add_child("sc.collects.collect", record.clone());
                }
            }
        }
        let mut out = ScOutput::empty();
        out.send(initiator, msg);
        out
    }

    /// A peer's recorded state arrived at the initiator.
    fn handle_state(&mut self, msg: &Message, from: &NodeId) -> ScOutput {
        if !self.peers.contains(from) {
            return ScOutput::empty();
        }
        let matches_version = match &self.version {
            Some((initiator, id)) => {
                msg.sub.get("sc.marker.uuid") == Some(initiator.as_str())
                    && msg.sub.get_parsed::<u64>("sc.marker.int") == Some(*id)
            }
            None => false,
        };
        if matches_version {
            self.states_received += 1;
            info!("received collected state from peer {from}");
            let version = self.version.clone().expect("checked above");
            self.collected.push((version, msg.sub.clone()));
        }
        if self.states_received == self.peers.len().saturating_sub(1) {
            let out = self.state_response();
            self.states_received = 0;
            return out;
        }
        ScOutput::empty()
    }

    /// Initiator: assemble the reply for the requesting module.
    fn state_response(&mut self) -> ScOutput {
        let Some(version) = self.version.clone() else {
            return ScOutput::empty();
        };
        if self.markers_seen != self.peers.len() || self.recording {
            info!(
                "not all states in yet: markers {}/{} recording {}",
                self.markers_seen,
                self.peers.len(),
                self.recording
            );
            self.markers_seen = 0;
            self.recording = false;
            return ScOutput::empty();
        }
        info!("assembling collected states for module {}", self.module);
        let mut msg = Message::new(format!("{}.CollectedState", self.module));
        for (v, state) in &self.collected {
            if *v != version {
                continue;
            }
            let Some(collects) = state.get_child("sc.collects") else {
                continue;
            };
            for record in collects.trees("collect") {
                let dtype = record.get("type").unwrap_or("");
                let count: usize = record.get_parsed("count").unwrap_or(0);
                let value = record.get("value").unwrap_or("");
                let key = match dtype {
                    "Sst" => "CollectedState.gateway.value",
                    "Drer" => "CollectedState.generation.value",
                    "Desd" => "CollectedState.storage.value",
                    "Load" => "CollectedState.drain.value",
                    "Fid" => "CollectedState.state.value",
                    "Message" => "CollectedState.intransit.value",
                    _ => continue,
                };
                if dtype == "Message" || count > 0 {
                    msg.sub.add(key, value);
                } else {
                    msg.sub.add(key, "no device");
                }
            }
        }
        let mut out = ScOutput::empty();
        // Looped back to this node: the dispatcher hands it to the
        // requesting module.
        out.send(self.me.clone(), msg);
        self.collected.clear();
        self.markers_seen = 0;
        self.version = None;
        out
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn marker(&self) -> Message {
        let mut msg = Message::new("sc.marker");
        msg.sub.put("sc.source", self.me.as_str());
        msg.sub
            .put("sc.id", self.version.as_ref().map(|v| v.1).unwrap_or(0).to_string());
        for device in &self.device_list {
            msg.sub.add("sc.devices.device", device.as_str());
        }
        msg
    }

    /// Read the requested device signals into a state record.
    fn take_snapshot(&self, devices: &dyn DeviceIndex) -> SubTree {
        let mut state = SubTree::new();
        state.put("sc.source", self.me.as_str());
        for query in &self.device_list {
            let Some((dtype, signal)) = query.split_once(':') else {
                warn!("incorrect device specification: {query}");
                continue;
            };
            let value = devices.net_value(dtype, signal);
            let count = devices.count_of_type(dtype);
            info!("device {dtype} signal {signal} value {value}");
            let mut record = SubTree::new();
            record.add("type", dtype);
            record.add("signal", signal);
            record.add("value", value.to_string());
            record.add("count", count.to_string());
            state.add_child("sc.collects.collect", record);
        }
        state
    }

    fn reset_cut(&mut self) {
        self.version = None;
        self.markers_seen = 0;
        self.collected.clear();
    }

    /// Build the request message a module sends to start a collection.
    pub fn request(module: &str, source: &NodeId, queries: &[(&str, &str)]) -> Message {
        let mut msg = Message::new("sc.request");
        msg.sub.put("sc.module", module);
        msg.sub.put("sc.source", source.as_str());
        msg.sub.put("sc.deviceNum", queries.len().to_string());
        for (dtype, signal) in queries {
            let mut entry = SubTree::new();
            entry.add("deviceType", *dtype);
            entry.add("valueType", *signal);
            msg.sub.add_child("sc.devices.device", entry);
        }
        msg
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
