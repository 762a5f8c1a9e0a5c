//! Mask-based secure aggregation.
//!
//! The Guest encrypts its contribution by adding, per Host, a pseudorandom
//! pad derived from the pairwise session key; each Host subtracts the
//! identical pad. Summed modulo the group order at the Arbiter, the pads
//! cancel exactly and only the weighted sum of the plaintext contributions
//! remains.
//!
//! All arithmetic after encoding is integer arithmetic in the group of
//! [`MaskConfig::order`], so cancellation does not depend on floating-point
//! rounding.

pub(crate) mod config;
pub(crate) mod masking;
pub(crate) mod model;

pub use self::{
    config::MaskConfig,
    masking::{
        Aggregation, AggregationError, MaskError, MaskedModel, MaskedScalar, PadCipher, PadSign,
    },
    model::Model,
};
