//! The phase-based round-robin scheduler.
//!
//! Modules register in order with a phase duration; the broker rotates
//! through them, re-deriving the correct phase from wall-clock time (plus
//! the synchronizer's skew) at a fixed alignment interval so that every
//! node in a group runs the same module at the same moment. Tasks are
//! plain values of a caller-chosen type — the broker never executes
//! anything itself, it only decides *when* a task becomes runnable and
//! with which completion code.

use {
    log::{debug, info},
    std::collections::{BTreeMap, HashMap, VecDeque},
};

/// Recyclable handle naming a timer in the registry.
pub type TimerHandle = u32;

/// How long to wait between wall-clock phase re-alignments, in ms.
pub const ALIGNMENT_DURATION_MS: u64 = 250;

/// Completion code handed to a task when it becomes runnable.
///
/// `Cancelled` means the timer that owned the task was cancelled or
/// re-armed before it fired; the task body should not run its normal
/// action. Next-round expirations deliver `Normal` — being pushed to the
/// start of the owner's next phase is the intended behavior, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The timer fired (or the task was queued directly).
    Normal,
    /// The timer was cancelled before firing.
    Cancelled,
}

/// What a phase-timer tick changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseChange {
    /// True when the current module actually changed.
    pub changed: bool,
    /// True when the rotation wrapped back to the first module.
    pub new_round: bool,
    /// How long the new phase will run, in ms.
    pub duration_ms: u64,
}

struct TimerState<T> {
    module: String,
    /// Armed deadline; `None` while disarmed or armed as next-round.
    deadline_ms: Option<u64>,
    task: Option<T>,
    next_round: bool,
}

/// The scheduler. See the module docs for the execution model.
pub struct Broker<T> {
    modules: Vec<(String, u64)>,
    phase: usize,
    phase_ends_ms: u64,
    last_alignment_ms: u64,
    skew_ms: i64,
    ready: HashMap<String, VecDeque<(T, Completion)>>,
    timers: BTreeMap<TimerHandle, TimerState<T>>,
    next_handle: TimerHandle,
    stopping: bool,
}

impl<T> Broker<T> {
    /// Create an empty scheduler. `now_ms` seeds the alignment clock so
    /// that the very first phase change aligns to wall time.
    pub fn new(now_ms: u64) -> Self {
        Broker {
            modules: Vec::new(),
            phase: 0,
            phase_ends_ms: now_ms,
            last_alignment_ms: now_ms.saturating_sub(2 * ALIGNMENT_DURATION_MS),
            skew_ms: 0,
            ready: HashMap::new(),
            timers: BTreeMap::new(),
            next_handle: 0,
            stopping: false,
        }
    }

    // ── Module registry ─────────────────────────────────────────────────

    /// Register a module for the rotation. Idempotent: re-registering an
    /// existing module is a no-op. The first registration triggers an
    /// immediate phase change so the first phase is entered.
    pub fn register_module(
        &mut self,
        module: impl Into<String>,
        phase_ms: u64,
        now_ms: u64,
    ) -> Option<PhaseChange> {
        let module = module.into();
        if self.modules.iter().any(|(m, _)| *m == module) {
            return None;
        }
        self.modules.push((module, phase_ms));
        if self.modules.len() == 1 {
            Some(self.change_phase(now_ms))
        } else {
            None
        }
    }

    /// The module that currently holds the phase.
    pub fn current_module(&self) -> Option<&str> {
        self.modules.get(self.phase).map(|(m, _)| m.as_str())
    }

    /// Time until the current phase ends. Negative on overrun.
    pub fn time_remaining(&self, now_ms: u64) -> i64 {
        self.phase_ends_ms as i64 - now_ms as i64
    }

    /// Wall-clock instant at which the current phase ends.
    pub fn phase_deadline(&self) -> u64 {
        self.phase_ends_ms
    }

    /// Feed in the latest skew estimate from the clock synchronizer.
    pub fn set_skew_ms(&mut self, skew_ms: i64) {
        self.skew_ms = skew_ms;
    }

    // ── Timers ──────────────────────────────────────────────────────────

    /// Allocate a recyclable timer owned by `module`.
    pub fn allocate_timer(&mut self, module: impl Into<String>) -> TimerHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.timers.insert(
            handle,
            TimerState {
                module: module.into(),
                deadline_ms: None,
                task: None,
                next_round: false,
            },
        );
        handle
    }

    /// Arm `handle` to deliver `task` after `wait_ms`. A `None` wait means
    /// "next round": the timer has no finite deadline and fires with a
    /// clean completion when its owner's phase next ends.
    ///
    /// Re-arming an already armed timer first delivers the pending task
    /// with [`Completion::Cancelled`].
    pub fn schedule_at(&mut self, handle: TimerHandle, wait_ms: Option<u64>, task: T, now_ms: u64) {
        if self.stopping {
            return;
        }
        self.disarm(handle, Completion::Cancelled);
        let Some(state) = self.timers.get_mut(&handle) else {
            return;
        };
        match wait_ms {
            Some(wait) => {
                state.deadline_ms = Some(now_ms.saturating_add(wait));
                state.next_round = false;
            }
            None => {
                state.deadline_ms = None;
                state.next_round = true;
            }
        }
        state.task = Some(task);
        debug!("armed timer {handle} (next_round={})", state.next_round);
    }

    /// Cancel `handle`. A pending task is delivered with
    /// [`Completion::Cancelled`]; cancelling a disarmed timer is a no-op.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.disarm(handle, Completion::Cancelled);
    }

    /// The earliest finite timer deadline, if any timer is armed.
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.values().filter_map(|t| t.deadline_ms).min()
    }

    /// Move every timer whose deadline has passed into its owner's ready
    /// queue with a clean completion. Returns true if anything fired.
    pub fn expire_due_timers(&mut self, now_ms: u64) -> bool {
        let due: Vec<TimerHandle> = self
            .timers
            .iter()
            .filter(|(_, t)| matches!(t.deadline_ms, Some(d) if d <= now_ms))
            .map(|(h, _)| *h)
            .collect();
        for handle in &due {
            self.disarm(*handle, Completion::Normal);
        }
        !due.is_empty()
    }

    /// Disarm a timer, delivering any pending task with `completion`.
    fn disarm(&mut self, handle: TimerHandle, completion: Completion) {
        let Some(state) = self.timers.get_mut(&handle) else {
            return;
        };
        state.deadline_ms = None;
        state.next_round = false;
        if let Some(task) = state.task.take() {
            let module = state.module.clone();
            self.ready.entry(module).or_default().push_back((task, completion));
        }
    }

    // ── Work queues ─────────────────────────────────────────────────────

    /// Enqueue `task` on `module`'s work queue. Returns true when the
    /// caller should kick the worker (per `start_worker`).
    pub fn schedule_now(&mut self, module: impl Into<String>, task: T, start_worker: bool) -> bool {
        if self.stopping {
            return false;
        }
        let module = module.into();
        let queue = self.ready.entry(module.clone()).or_default();
        queue.push_back((task, Completion::Normal));
        debug!("module {module} now has queue size {}", queue.len());
        start_worker
    }

    /// Pop the next runnable task for the module currently holding the
    /// phase. The hosting loop calls this repeatedly until it returns
    /// `None` — at most one task runs at a time, to completion.
    pub fn pop_ready(&mut self) -> Option<(T, Completion)> {
        let current = self.current_module()?.to_string();
        self.ready.get_mut(&current)?.pop_front()
    }

    /// Queue depth for a module (observability and tests).
    pub fn queue_len(&self, module: &str) -> usize {
        self.ready.get(module).map_or(0, VecDeque::len)
    }

    // ── Phase rotation ──────────────────────────────────────────────────

    /// Advance the phase. Called when the phase timer fires.
    ///
    /// Normally the rotation steps to the next module for its full
    /// duration; when the alignment interval has elapsed, the phase is
    /// instead recomputed from wall-clock time (adjusted by the skew) and
    /// shortened to the remaining wall-clock budget of that slot.
    pub fn change_phase(&mut self, now_ms: u64) -> PhaseChange {
        if self.modules.is_empty() {
            self.phase = 0;
            return PhaseChange {
                changed: false,
                new_round: false,
                duration_ms: 0,
            };
        }
        let old_phase = self.phase;
        self.phase += 1;
        if self.phase >= self.modules.len() {
            self.phase = 0;
        }

        let round_total: u64 = self.modules.iter().map(|(_, d)| d).sum();
        let adjusted = (now_ms as i64 + self.skew_ms).max(0) as u64;
        let into_round = adjusted % round_total;

        // Walk the rotation: the slot whose cumulative budget first exceeds
        // the in-round offset is the wall-clock phase.
        let mut cphase = 0;
        let mut cumulative = self.modules[0].1;
        while cphase + 1 < self.modules.len() && cumulative < into_round {
            cphase += 1;
            cumulative += self.modules[cphase].1;
        }
        let remaining = cumulative.saturating_sub(into_round);

        let mut duration_ms = self.modules[self.phase].1;
        if now_ms.saturating_sub(self.last_alignment_ms) > ALIGNMENT_DURATION_MS {
            info!(
                "aligned phase to {cphase} (was {}) for {remaining} ms",
                self.phase
            );
            self.phase = cphase;
            self.last_alignment_ms = now_ms;
            duration_ms = remaining;
        }
        info!(
            "phase: {} for {duration_ms} ms (skew {} ms)",
            self.modules[self.phase].0, self.skew_ms
        );

        let changed = self.phase != old_phase;
        if changed {
            // Next-round timers of the outgoing module fire now with a
            // clean completion, so their tasks lead the owner's next phase.
            let outgoing = self.modules[old_phase].0.clone();
            let expiring: Vec<TimerHandle> = self
                .timers
                .iter()
                .filter(|(_, t)| t.module == outgoing && t.next_round)
                .map(|(h, _)| *h)
                .collect();
            for handle in expiring {
                debug!("expiring next-round timer {handle} for {outgoing}");
                self.disarm(handle, Completion::Normal);
            }
        }

        self.phase_ends_ms = now_ms.saturating_add(duration_ms);
        PhaseChange {
            changed,
            new_round: changed && self.phase == 0,
            duration_ms,
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Stop the scheduler: every armed timer is cancelled (its task is
    /// delivered with [`Completion::Cancelled`]) and no new work is
    /// accepted.
    pub fn stop(&mut self) {
        self.stopping = true;
        let handles: Vec<TimerHandle> = self.timers.keys().copied().collect();
        for handle in handles {
            self.disarm(handle, Completion::Cancelled);
        }
    }

    /// True once `stop` has been requested.
    pub fn stopping(&self) -> bool {
        self.stopping
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
