//! The node's event loop.
//!
//! One task owns everything: the scheduler, the peer registry, the
//! dispatcher, the agents, and the clock synchronizer. All agent
//! callbacks, protocol transitions, and timer expirations run serialized
//! on this loop; the only suspension points are the socket and the sleep
//! until the next deadline, which is exactly the cooperative model the
//! phase scheduler assumes.

use {
    crate::config::NodeConfig,
    dgi_agents::{DeviceTable, GmAgent, GmTask, LbAgent, LbTask, Output, ScAgent, ScTask},
    dgi_core::{now_ms, Message, MessageKind, NodeId, Result},
    dgi_net::{
        endpoint::peer_host_of, Dispatcher, Endpoint, Inbound, PeerRegistry, ProtocolConfig,
        SendOutcome,
    },
    dgi_sched::{Broker, ClockSynchronizer, Completion},
    log::{debug, info, warn},
    std::time::Duration,
    tokio::sync::mpsc,
};

/// Everything the scheduler can hand back to the service.
#[derive(Debug)]
pub enum NodeTask {
    /// Group-management timer continuation.
    Gm(GmTask),
    /// State-collection task.
    Sc(ScTask),
    /// Load-balance timer continuation.
    Lb(LbTask),
    /// A delivered message bound for one module.
    Deliver {
        module: String,
        msg: Box<Message>,
        from: NodeId,
    },
}

/// The running node.
pub struct NodeService {
    cfg: NodeConfig,
    broker: Broker<NodeTask>,
    registry: PeerRegistry,
    endpoint: Endpoint,
    inbound: mpsc::Receiver<Inbound>,
    dispatcher: Dispatcher,
    gm: GmAgent,
    sc: ScAgent,
    lb: LbAgent,
    clock: ClockSynchronizer,
    devices: DeviceTable,
    stopping: bool,
}

impl NodeService {
    /// Bind the socket and assemble the node.
    pub async fn new(cfg: NodeConfig, devices: DeviceTable) -> Result<Self> {
        let (endpoint, inbound) = Endpoint::bind(&cfg.address, cfg.port).await?;
        let now = now_ms();

        let mut broker = Broker::new(now);
        for (module, duration) in cfg.timings.phase_table() {
            broker.register_module(module, duration.as_millis() as u64, now);
        }
        let gm_timer = broker.allocate_timer("gm");
        let gm_fid_timer = broker.allocate_timer("gm");
        let lb_timer = broker.allocate_timer("lb");

        let proto_cfg =
            ProtocolConfig::from_timings(cfg.me.clone(), cfg.my_host.clone(), &cfg.timings);
        let registry = PeerRegistry::new(proto_cfg);

        let mut dispatcher = Dispatcher::new();
        dispatcher.register("gm", "gm.");
        dispatcher.register("sc", "sc.");
        // State collection watches everything: channel traffic recorded
        // during a cut arrives through this registration.
        dispatcher.register("sc", "any");
        dispatcher.register("lb", "lb.");

        let gm = GmAgent::new(
            cfg.me.clone(),
            cfg.my_host.clone(),
            cfg.timings.clone(),
            gm_timer,
            gm_fid_timer,
        );
        let sc = ScAgent::new(cfg.me.clone());
        let lb = LbAgent::new(cfg.me.clone(), cfg.timings.clone(), lb_timer);
        let clock = ClockSynchronizer::new(cfg.me.clone());

        Ok(NodeService {
            cfg,
            broker,
            registry,
            endpoint,
            inbound,
            dispatcher,
            gm,
            sc,
            lb,
            clock,
            devices,
            stopping: false,
        })
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(mut self) -> Result<()> {
        let now = now_ms();
        for (id, host) in self.cfg.peers.clone() {
            self.registry.put_hostname(id, host);
        }
        info!("node {} entering service", self.cfg.me);

        // Start the agents.
        let peers = self.cfg.peers.clone();
        let gm_out = self.gm.run(&peers, now);
        self.apply(gm_out, NodeTask::Gm, "gm").await?;
        let lb_out = self.lb.run();
        self.apply(lb_out, NodeTask::Lb, "lb").await?;

        let mut clock_tick = tokio::time::interval(Duration::from_millis(
            self.cfg.timings.CS_EXCHANGE_TIME.max(1),
        ));
        clock_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.drain_worker().await?;
            if self.stopping {
                break;
            }

            let now = now_ms();
            let deadline = self.next_deadline();
            let sleep = Duration::from_millis(deadline.saturating_sub(now));

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("caught interrupt, shutting down");
                    self.shutdown();
                }
                inbound = self.inbound.recv() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound).await?,
                    None => {
                        warn!("inbound channel closed");
                        self.shutdown();
                    }
                },
                _ = clock_tick.tick() => self.clock_exchange().await?,
                _ = tokio::time::sleep(sleep) => self.on_deadline().await?,
            }
        }
        info!("node {} stopped", self.cfg.me);
        Ok(())
    }

    /// Stop accepting work, cancel timers, and tear the directory down.
    pub fn shutdown(&mut self) {
        self.stopping = true;
        self.broker.stop();
        self.registry.stop_all();
    }

    // ── Deadlines ───────────────────────────────────────────────────────

    fn next_deadline(&self) -> u64 {
        let mut deadline = self.broker.phase_deadline();
        if let Some(t) = self.broker.next_timer_deadline() {
            deadline = deadline.min(t);
        }
        if let Some(t) = self.registry.next_resend_deadline() {
            deadline = deadline.min(t);
        }
        deadline
    }

    /// A deadline passed: rotate the phase, fire timers, retransmit.
    async fn on_deadline(&mut self) -> Result<()> {
        let now = now_ms();
        if now >= self.broker.phase_deadline() {
            // Feed the latest skew into the alignment before rotating.
            self.broker.set_skew_ms(self.clock.offset_ms());
            let change = self.broker.change_phase(now);
            if change.changed {
                self.registry.change_phase(change.new_round);
            }
        }
        self.broker.expire_due_timers(now);
        let resends = self.registry.collect_resends(now);
        for (peer, msg) in resends {
            self.write(&peer, &msg).await?;
        }
        Ok(())
    }

    /// Run every ready task of the current phase, one at a time.
    async fn drain_worker(&mut self) -> Result<()> {
        while let Some((task, completion)) = self.broker.pop_ready() {
            self.run_task(task, completion).await?;
        }
        Ok(())
    }

    // ── Task execution ──────────────────────────────────────────────────

    async fn run_task(&mut self, task: NodeTask, completion: Completion) -> Result<()> {
        let now = now_ms();
        match task {
            NodeTask::Gm(task) => {
                let out = self.gm.on_task(task, completion, now, &self.devices);
                self.apply(out, NodeTask::Gm, "gm").await
            }
            NodeTask::Sc(task) => {
                if completion == Completion::Cancelled {
                    return Ok(());
                }
                let out = self.sc.on_task(task, &self.devices);
                self.apply(out, NodeTask::Sc, "sc").await
            }
            NodeTask::Lb(task) => {
                let remaining = self.broker.time_remaining(now);
                let out = self.lb.on_task(task, completion, remaining, &self.devices);
                self.apply(out, NodeTask::Lb, "lb").await
            }
            NodeTask::Deliver { module, msg, from } => {
                if completion == Completion::Cancelled {
                    return Ok(());
                }
                match module.as_str() {
                    "gm" => {
                        let out = self.gm.handle(&msg, &from, now);
                        self.apply(out, NodeTask::Gm, "gm").await
                    }
                    "sc" => {
                        let out = self.sc.handle(&msg, &from, &self.devices);
                        self.apply(out, NodeTask::Sc, "sc").await
                    }
                    "lb" => {
                        let out = self.lb.handle(&msg, &from, now);
                        self.apply(out, NodeTask::Lb, "lb").await
                    }
                    other => {
                        warn!("delivery for unknown module '{other}'");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Apply one agent transition: register hosts, arm timers, queue
    /// work, and put the messages on the wire.
    async fn apply<T>(
        &mut self,
        out: Output<T>,
        wrap: fn(T) -> NodeTask,
        module: &str,
    ) -> Result<()> {
        let now = now_ms();
        for (id, host) in out.hosts {
            self.registry.put_hostname(id, host);
        }
        for arm in out.timers {
            self.broker
                .schedule_at(arm.handle, arm.wait_ms, wrap(arm.task), now);
        }
        for task in out.queue {
            self.broker.schedule_now(module, wrap(task), true);
        }
        for (to, msg) in out.sends {
            self.send_to(&to, msg, now).await?;
        }
        Ok(())
    }

    /// Send through the peer's connection, looping self-sends back into
    /// the dispatcher.
    async fn send_to(&mut self, to: &NodeId, msg: Message, now: u64) -> Result<()> {
        let outcome = self.registry.connection(to).send(msg, now);
        match outcome {
            SendOutcome::Local(msg) => self.dispatch(msg, self.cfg.me.clone()),
            SendOutcome::Wire(writes) => {
                for msg in writes {
                    self.write(to, &msg).await?;
                }
                Ok(())
            }
        }
    }

    /// Write one frame to a peer's registered address.
    async fn write(&mut self, to: &NodeId, msg: &Message) -> Result<()> {
        let Some(host) = self.registry.host_of(to).cloned() else {
            warn!("no address registered for {to}, dropping {}", msg.kind_str());
            return Ok(());
        };
        if let Err(e) = self.endpoint.send(&host, msg).await {
            // The reliability layer retries; repeated failures surface as
            // membership loss.
            warn!("send to {to} failed: {e}");
        }
        Ok(())
    }

    // ── Inbound path ────────────────────────────────────────────────────

    async fn handle_inbound(&mut self, inbound: Inbound) -> Result<()> {
        let now = now_ms();
        let src = inbound.message.source.clone();
        if src == self.cfg.me || src.as_str().is_empty() {
            return Ok(());
        }
        // First contact registers the peer's address.
        self.registry.put_hostname(src.clone(), peer_host_of(&inbound));
        let msg = inbound.message;
        debug!("received {} '{}' from {src}", msg.kind_str(), msg.handler);

        match msg.kind {
            MessageKind::Ack => {
                let out = self.registry.connection(&src).receive_ack(&msg, now);
                for write in out.writes {
                    self.write(&src, &write).await?;
                }
                Ok(())
            }
            MessageKind::ClockReading => {
                let reception = self.registry.connection(&src).receive(&msg, now);
                for write in reception.writes {
                    self.write(&src, &write).await?;
                }
                if reception.deliver {
                    self.handle_clock(&src, &msg, now).await?;
                }
                Ok(())
            }
            _ => {
                let reception = self.registry.connection(&src).receive(&msg, now);
                for write in reception.writes {
                    self.write(&src, &write).await?;
                }
                if reception.deliver {
                    self.dispatch(msg, src)?;
                }
                Ok(())
            }
        }
    }

    /// Queue a delivered message for every module registered for it.
    fn dispatch(&mut self, msg: Message, from: NodeId) -> Result<()> {
        let modules: Vec<String> = self
            .dispatcher
            .route(&msg.handler)
            .into_iter()
            .map(str::to_string)
            .collect();
        for module in modules {
            self.broker.schedule_now(
                module.clone(),
                NodeTask::Deliver {
                    module,
                    msg: Box::new(msg.clone()),
                    from: from.clone(),
                },
                true,
            );
        }
        Ok(())
    }

    // ── Clock synchronization ───────────────────────────────────────────

    async fn clock_exchange(&mut self) -> Result<()> {
        let now = now_ms();
        let peers = self.registry.known_peers();
        let sends = self.clock.exchange(&peers, now);
        for (peer, msg) in sends {
            self.send_to(&peer, msg, now).await?;
        }
        self.broker.set_skew_ms(self.clock.offset_ms());
        Ok(())
    }

    async fn handle_clock(&mut self, from: &NodeId, msg: &Message, now: u64) -> Result<()> {
        match msg.handler.as_str() {
            "clk.Exchange" => {
                if let Some(mut resp) = self.clock.on_exchange(msg) {
                    resp.sent_at_ms = now;
                    self.send_to(from, resp, now).await?;
                }
            }
            "clk.ExchangeResponse" => {
                self.clock.on_exchange_response(from, msg, now);
            }
            other => debug!("unknown clock message '{other}'"),
        }
        Ok(())
    }

    // ── Observability (used by tests and logs) ──────────────────────────

    /// The module currently holding the phase.
    pub fn current_module(&self) -> Option<&str> {
        self.broker.current_module()
    }

    /// A read-only view of the group-management agent.
    pub fn group_agent(&self) -> &GmAgent {
        &self.gm
    }

    /// Mutable access to the device table (fixtures in tests).
    pub fn devices_mut(&mut self) -> &mut DeviceTable {
        &mut self.devices
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cli;
    use clap::Parser;
    use dgi_core::Timings;

    fn config(port: u16) -> NodeConfig {
        let cli = Cli::parse_from([
            "dgi-node",
            "--address",
            "127.0.0.1",
            "--port",
            &port.to_string(),
            "--timings",
            "unused.toml",
        ]);
        NodeConfig {
            address: cli.address.clone(),
            port,
            me: NodeId::from_endpoint(&cli.address, port),
            my_host: dgi_core::RemoteHost::new(cli.address.as_str(), port),
            peers: Vec::new(),
            timings: Timings::dev_default(),
        }
    }

    #[tokio::test]
    async fn test_service_assembles_and_enters_first_phase() {
        let svc = NodeService::new(config(0), DeviceTable::new()).await.unwrap();
        assert_eq!(svc.current_module(), Some("gm"));
        assert!(svc.group_agent().is_coordinator());
    }

    #[tokio::test]
    async fn test_local_send_routes_through_dispatcher() {
        let mut svc = NodeService::new(config(0), DeviceTable::new())
            .await
            .unwrap();
        let me = svc.cfg.me.clone();
        let msg = svc.gm.peer_list("any");
        svc.send_to(&me, msg, now_ms()).await.unwrap();
        // The loopback delivery lands on every registered module's queue.
        assert!(svc.broker.queue_len("gm") > 0);
        assert!(svc.broker.queue_len("sc") > 0);
        assert!(svc.broker.queue_len("lb") > 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut svc = NodeService::new(config(0), DeviceTable::new())
            .await
            .unwrap();
        svc.shutdown();
        svc.shutdown();
        assert!(svc.stopping);
    }
}
