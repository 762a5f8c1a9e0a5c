//! The per-round aggregation procedures.
//!
//! [`aggregator`] drives the protocol for each role: [`aggregator::Member`]
//! for the Guest and the Hosts, [`aggregator::Arbiter`] for the relay. The
//! Arbiter decides termination with the [`convergence`] criterion and
//! broadcasts its verdict every round.

pub mod aggregator;
pub mod convergence;
