//! DGI Broker integration tests.
//!
//! End-to-end scenarios across the messaging layer and the distributed
//! agents:
//!
//! 1. **Reliable delivery** — ordered delivery and window drain over a
//!    real loopback datagram path, with and without injected loss, plus
//!    session reset after a node restart.
//! 2. **Leader election** — three partitioned nodes converge on the
//!    lexicographically smallest coordinator once connectivity returns,
//!    and every member learns the full membership.
//! 3. **Global snapshots** — a three-node Chandy–Lamport cut sums device
//!    states consistently and captures in-flight traffic exactly once.

pub mod harness;

#[cfg(test)]
mod delivery_tests;


#[cfg(test)]
mod snapshot_tests;
