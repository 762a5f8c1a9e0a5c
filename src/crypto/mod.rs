//! Cryptographic primitives of the federation protocol.
//!
//! [`DhKeyPair`] and [`SessionKey`] implement the pairwise Diffie-Hellman
//! key agreement between the Guest and each Host; [`generate_integer`]
//! expands a seeded PRNG into uniform group elements for the masking layer.
//!
//! `sodiumoxide` must be initialized before any of this is used in a
//! multi-threaded context.

pub(crate) mod dh;
pub(crate) mod prng;

pub use self::{
    dh::{CryptoError, DhKeyPair, DhParams, SessionKey},
    prng::generate_integer,
};
