//! # Fedsum: secure aggregation for horizontal federated learning
//!
//! Fedsum is the synchronization and aggregation substrate for a federation
//! of mutually-distrusting parties: one *Guest*, any number of *Hosts* and
//! one *Arbiter*. The parties jointly compute a weighted sum of their local
//! model updates and losses without revealing any individual contribution to
//! the Arbiter, which acts as relay and aggregator only.
//!
//! The crate provides:
//!
//! - [`transfer`]: named, role-authorized channels and a round-addressed
//!   transport, so the same channel can be reused across training iterations
//!   without collision.
//! - [`sync`]: the party-identity negotiation (UUID conflict resolution) and
//!   the pairwise Diffie-Hellman key agreement relayed through the Arbiter.
//! - [`mask`]: the random-padding cipher. The Guest adds one pseudorandom
//!   mask per Host to its contribution, each Host subtracts the identical
//!   mask, and the masks cancel exactly in the Arbiter's modular sum.
//! - [`procedure`]: the per-round aggregation drivers and the absolute-loss
//!   convergence criterion.
//!
//! The model being trained, mini-batch sampling and metric callbacks are the
//! caller's concern; the entry points a training loop needs are
//! [`procedure::aggregator::Member`] and [`procedure::aggregator::Arbiter`].
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use fedsum::{
//!     mask::MaskConfig,
//!     procedure::aggregator::Member,
//!     transfer::{transport::Federation, ChannelRegistry},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fedsum::ProtocolError> {
//!     let registry = Arc::new(ChannelRegistry::homo());
//!     let federation = Federation::local(1, registry, Duration::from_secs(30));
//!     let mut guest = Member::guest(federation.guest, MaskConfig::default(), 30)?;
//!     guest.initialize_aggregator(None)?;
//!     guest.exchange_secret_keys().await?;
//!     Ok(())
//! }
//! ```

pub mod crypto;
pub mod mask;
pub mod procedure;
pub mod settings;
pub mod sync;
pub mod transfer;

use thiserror::Error;

use crate::{
    crypto::CryptoError,
    mask::{AggregationError, MaskError},
    transfer::{transport::TransferError, PartyId},
};

/// A fatal protocol failure.
///
/// Any error of this type ends the current training session; no aggregation
/// round may complete partially. Transport timeouts are surfaced here rather
/// than retried, so re-running a failed negotiation is the caller's decision.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("key agreement failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("masking failed: {0}")]
    Mask(#[from] MaskError),

    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("uuid negotiation still conflicted after {0} attempts")]
    UuidRetriesExhausted(u32),

    #[error("party {party} may not run the {procedure} procedure")]
    WrongRole {
        party: PartyId,
        procedure: &'static str,
    },

    #[error("secret keys have not been exchanged yet")]
    MissingCipher,

    #[error("the aggregator has not been initialized")]
    NotInitialized,

    #[error("total party weight must be positive, got {0}")]
    InvalidPartyWeight(f64),
}
