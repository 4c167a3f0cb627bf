//! Test harnesses for multi-node scenarios.
//!
//! Two fixtures live here:
//!
//! - [`GmSim`] — a deterministic, virtual-time simulator for the
//!   group-management agents. It reproduces the scheduler's timer
//!   semantics (re-arming a timer delivers the displaced task with a
//!   cancelled completion) and a FIFO 1 ms message fabric, optionally
//!   partitioned until a configurable instant.
//! - [`UdpNode`] — one node's real transport stack (endpoint + peer
//!   registry) on a loopback socket, for exercising the reliable
//!   protocols over an actual datagram path.

use {
    dgi_agents::{DeviceTable, GmAgent, GmTask, Output},
    dgi_core::{Message, MessageKind, NodeId, RemoteHost, Timings},
    dgi_net::{Endpoint, Inbound, PeerRegistry, ProtocolConfig},
    dgi_sched::{Completion, TimerHandle},
    std::{
        collections::{BTreeMap, HashMap, VecDeque},
        time::Duration,
    },
    tokio::sync::mpsc,
};

type GmOutput = Output<GmTask>;

// ── Deterministic group-management simulator ────────────────────────────────

enum SimEvent {
    Timer {
        node: usize,
        handle: TimerHandle,
        gen: u64,
    },
    Message {
        to: usize,
        from: usize,
        msg: Box<Message>,
    },
}

/// Virtual-time simulation of N group-management agents.
pub struct GmSim {
    pub agents: Vec<GmAgent>,
    pub ids: Vec<NodeId>,
    devices: Vec<DeviceTable>,
    events: BTreeMap<(u64, u64), SimEvent>,
    timers: Vec<HashMap<TimerHandle, (u64, GmTask, u64)>>,
    seq: u64,
    gen: u64,
    now: u64,
    /// Inter-node messages are dropped before this instant.
    connect_at: u64,
}

impl GmSim {
    /// Build a cluster where every node statically knows every other.
    pub fn new(names: &[&str]) -> Self {
        let ids: Vec<NodeId> = names.iter().map(|n| NodeId::from(*n)).collect();
        let agents = names
            .iter()
            .map(|name| {
                let host = name.split(':').next().unwrap();
                GmAgent::new(
                    NodeId::from(*name),
                    RemoteHost::new(host, 1870),
                    Timings::dev_default(),
                    0,
                    1,
                )
            })
            .collect();
        GmSim {
            agents,
            devices: (0..names.len()).map(|_| DeviceTable::new()).collect(),
            timers: (0..names.len()).map(|_| HashMap::new()).collect(),
            ids,
            events: BTreeMap::new(),
            seq: 0,
            gen: 0,
            now: 0,
            connect_at: 0,
        }
    }

    /// Drop every inter-node message before `at` (partition at startup).
    pub fn disconnect_until(&mut self, at: u64) {
        self.connect_at = at;
    }

    /// Start every agent with the full static host list.
    pub fn start(&mut self) {
        let hosts: Vec<(NodeId, RemoteHost)> = self
            .ids
            .iter()
            .map(|id| {
                let host = id.as_str().split(':').next().unwrap();
                (id.clone(), RemoteHost::new(host, 1870))
            })
            .collect();
        for node in 0..self.agents.len() {
            let out = self.agents[node].run(&hosts, self.now);
            self.apply(node, out);
        }
    }

    /// Process every event up to virtual time `until`.
    pub fn run_until(&mut self, until: u64) {
        while let Some((&(at, seq), _)) = self.events.iter().next() {
            if at > until {
                break;
            }
            let event = self.events.remove(&(at, seq)).expect("peeked above");
            self.now = at;
            match event {
                SimEvent::Timer { node, handle, gen } => {
                    let due = matches!(
                        self.timers[node].get(&handle),
                        Some((fire_at, _, armed_gen)) if *armed_gen == gen && *fire_at == at
                    );
                    if due {
                        let (_, task, _) =
                            self.timers[node].remove(&handle).expect("checked above");
                        let out = self.agents[node].on_task(
                            task,
                            Completion::Normal,
                            self.now,
                            &self.devices[node],
                        );
                        self.apply(node, out);
                    }
                }
                SimEvent::Message { to, from, msg } => {
                    let from_id = self.ids[from].clone();
                    let out = self.agents[to].handle(&msg, &from_id, self.now);
                    self.apply(to, out);
                }
            }
        }
        self.now = until;
    }

    fn apply(&mut self, node: usize, out: GmOutput) {
        let mut work: VecDeque<(usize, GmOutput)> = VecDeque::new();
        work.push_back((node, out));
        while let Some((n, out)) = work.pop_front() {
            for arm in out.timers {
                let wait = arm.wait_ms.expect("election timers carry deadlines");
                if let Some((_, displaced, _)) = self.timers[n].remove(&arm.handle) {
                    // Re-arming delivers the displaced task cancelled,
                    // exactly as the broker's timer registry does.
                    let o = self.agents[n].on_task(
                        displaced,
                        Completion::Cancelled,
                        self.now,
                        &self.devices[n],
                    );
                    work.push_back((n, o));
                }
                self.gen += 1;
                let fire_at = self.now + wait;
                self.timers[n].insert(arm.handle, (fire_at, arm.task, self.gen));
                let gen = self.gen;
                self.push(
                    fire_at,
                    SimEvent::Timer {
                        node: n,
                        handle: arm.handle,
                        gen,
                    },
                );
            }
            for (to, msg) in out.sends {
                let Some(to_idx) = self.ids.iter().position(|id| *id == to) else {
                    continue;
                };
                if to_idx != n && self.now < self.connect_at {
                    continue; // partitioned
                }
                let at = self.now + 1;
                self.push(
                    at,
                    SimEvent::Message {
                        to: to_idx,
                        from: n,
                        msg: Box::new(msg),
                    },
                );
            }
        }
    }

    fn push(&mut self, at: u64, event: SimEvent) {
        self.seq += 1;
        self.events.insert((at, self.seq), event);
    }
}

// ── Loopback transport fixture ──────────────────────────────────────────────

/// One node's real transport stack bound on 127.0.0.1.
pub struct UdpNode {
    pub id: NodeId,
    pub host: RemoteHost,
    pub registry: PeerRegistry,
    pub endpoint: Endpoint,
    pub inbound: mpsc::Receiver<Inbound>,
    pub delivered: Vec<Message>,
}

impl UdpNode {
    /// Bind an ephemeral port; the identifier follows the bound address.
    pub async fn spawn() -> Self {
        let (endpoint, inbound) = Endpoint::bind("127.0.0.1", 0).await.unwrap();
        let port = endpoint.local_addr().unwrap().port();
        let id = NodeId::from_endpoint("127.0.0.1", port);
        let host = RemoteHost::new("127.0.0.1", port);
        let registry = PeerRegistry::new(ProtocolConfig {
            local: id.clone(),
            local_host: host.clone(),
            resend_ms: 10,
            default_expire_ms: 2_000,
        });
        UdpNode {
            id,
            host,
            registry,
            endpoint,
            inbound,
            delivered: Vec::new(),
        }
    }

    /// Register a peer's address.
    pub fn add_peer(&mut self, other: &UdpNode) {
        self.registry
            .put_hostname(other.id.clone(), other.host.clone());
    }

    /// Send one application message to a peer over its default protocol.
    pub async fn send(&mut self, to: &NodeId, msg: Message) {
        let now = dgi_core::now_ms();
        match self.registry.connection(to).send(msg, now) {
            dgi_net::SendOutcome::Wire(writes) => {
                let host = self.registry.host_of(to).cloned().unwrap();
                for write in &writes {
                    self.endpoint.send(&host, write).await.unwrap();
                }
            }
            dgi_net::SendOutcome::Local(_) => panic!("loopback in a multi-node test"),
        }
    }

    /// Drain inbound frames for `budget`, answering with whatever the
    /// protocols want written (ACKs, SYNs, resync requests). Delivered
    /// data frames accumulate in `delivered`.
    pub async fn pump(&mut self, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let now = dgi_core::now_ms();
            let timeout = deadline.saturating_duration_since(tokio::time::Instant::now());
            if timeout.is_zero() {
                break;
            }
            let inbound = match tokio::time::timeout(timeout, self.inbound.recv()).await {
                Ok(Some(inbound)) => inbound,
                _ => break,
            };
            let src = inbound.message.source.clone();
            self.registry
                .put_hostname(src.clone(), dgi_net::endpoint::peer_host_of(&inbound));
            let msg = inbound.message;
            let writes = if msg.kind == MessageKind::Ack {
                self.registry.connection(&src).receive_ack(&msg, now).writes
            } else {
                let reception = self.registry.connection(&src).receive(&msg, now);
                if reception.deliver {
                    self.delivered.push(msg);
                }
                reception.writes
            };
            if let Some(host) = self.registry.host_of(&src).cloned() {
                for write in &writes {
                    self.endpoint.send(&host, write).await.unwrap();
                }
            }
        }
    }

    /// Fire any due retransmissions.
    pub async fn resend_due(&mut self) {
        let now = dgi_core::now_ms();
        for (peer, msg) in self.registry.collect_resends(now) {
            if let Some(host) = self.registry.host_of(&peer).cloned() {
                let _ = self.endpoint.send(&host, &msg).await;
            }
        }
    }
}
