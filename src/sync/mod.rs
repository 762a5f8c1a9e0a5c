//! Pre-training synchronization procedures.
//!
//! Before the first aggregation round the parties agree on unique identities
//! ([`identity`]) and establish pairwise session keys through the Arbiter
//! ([`key_exchange`]). Both procedures are driven once per session, in that
//! order.

pub mod identity;
pub mod key_exchange;
