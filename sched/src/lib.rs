//! Cooperative phase scheduler and clock synchronization.
//!
//! The [`Broker`] multiplexes a single execution context across the
//! registered modules by rotating exclusive wall-clock phases; work queued
//! for a module only runs while that module holds the phase. The
//! [`ClockSynchronizer`] produces the skew estimate the broker feeds into
//! its phase alignment, so that cooperating nodes land in the same phase at
//! the same wall-clock instant.
//!
//! Neither type performs I/O or owns an event loop. The hosting service
//! supplies wall-clock readings, sleeps until the deadlines the broker
//! reports, and runs whatever tasks the broker hands back — which keeps
//! every state transition here deterministic and directly testable.

pub mod clock;
pub mod scheduler;

pub use clock::ClockSynchronizer;
pub use scheduler::{Broker, Completion, PhaseChange, TimerHandle, ALIGNMENT_DURATION_MS};
