//! The broker's cooperating agents.
//!
//! Each agent is a deterministic state machine scheduled under its own
//! module phase: it consumes messages and timer completions and returns
//! an [`Output`] describing what should happen next — messages to send,
//! timers to arm, peers to register. All I/O and scheduling is performed
//! by the hosting service, which keeps every distributed algorithm in
//! this crate drivable from plain unit tests.

pub mod balance;
pub mod devices;
pub mod group;
pub mod snapshot;

pub use balance::{LbAgent, LbState, LbTask};
pub use devices::{DeviceIndex, DeviceTable};
pub use group::{GmAgent, GmTask, Role};
pub use snapshot::{ScAgent, ScTask};

use {
    dgi_core::{Message, NodeId, RemoteHost},
    dgi_sched::TimerHandle,
};

/// A timer the agent wants armed. `wait_ms == None` arms the timer as a
/// next-round timer.
#[derive(Debug)]
pub struct TimerArm<T> {
    /// Which registry timer to arm.
    pub handle: TimerHandle,
    /// Delay before firing; `None` means "start of my next phase".
    pub wait_ms: Option<u64>,
    /// The continuation delivered when the timer completes.
    pub task: T,
}

/// Everything an agent transition wants the hosting service to do.
#[derive(Debug)]
pub struct Output<T> {
    /// Messages to send, addressed by peer identifier (the local
    /// identifier short-circuits to the dispatcher).
    pub sends: Vec<(NodeId, Message)>,
    /// Timers to arm.
    pub timers: Vec<TimerArm<T>>,
    /// Tasks to queue immediately on the agent's own module.
    pub queue: Vec<T>,
    /// Peer addresses learned from message payloads, to be registered
    /// with the peer directory.
    pub hosts: Vec<(NodeId, RemoteHost)>,
}

impl<T> Default for Output<T> {
    fn default() -> Self {
        Output {
            sends: Vec::new(),
            timers: Vec::new(),
            queue: Vec::new(),
            hosts: Vec::new(),
        }
    }
}

impl<T> Output<T> {
    /// Nothing to do.
    pub fn empty() -> Self {
        Output::default()
    }

    /// Queue a message to a peer.
    pub fn send(&mut self, to: NodeId, msg: Message) {
        self.sends.push((to, msg));
    }

    /// Arm a timer.
    pub fn arm(&mut self, handle: TimerHandle, wait_ms: Option<u64>, task: T) {
        self.timers.push(TimerArm {
            handle,
            wait_ms,
            task,
        });
    }

    /// Absorb another output's effects after this one's.
    pub fn merge(&mut self, other: Output<T>) {
        self.sends.extend(other.sends);
        self.timers.extend(other.timers);
        self.queue.extend(other.queue);
        self.hosts.extend(other.hosts);
    }
}
