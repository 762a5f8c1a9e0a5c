//! Finite-field Diffie-Hellman key agreement.
//!
//! The Arbiter distributes the domain parameters, every party publishes
//! `g^x mod p`, and each Guest/Host pair derives the same [`SessionKey`]
//! from the shared secret. The default domain is the 2048-bit MODP group 14
//! of RFC 3526, whose generator 2 generates the prime-order subgroup.
//!
//! Received public values are untrusted: [`DhKeyPair::agree`] rejects any
//! value outside the open interval `(1, p-1)` or outside the prime-order
//! subgroup before it touches the private exponent.

use num::bigint::BigUint;
use serde::{Deserialize, Serialize};
use sodiumoxide::{
    crypto::{box_, hash::sha256},
    randombytes::randombytes,
};
use thiserror::Error;

/// 2048-bit MODP group 14 prime (RFC 3526, section 3).
const MODP_2048_PRIME_HEX: &[u8] =
    b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
      020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
      4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
      EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
      98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
      9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
      E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
      3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid Diffie-Hellman domain parameters")]
    InvalidParams,

    #[error("peer public value is outside the Diffie-Hellman group")]
    OutOfGroup,
}

/// Diffie-Hellman domain parameters: the modulus and the generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhParams {
    pub p: BigUint,
    pub g: BigUint,
}

impl DhParams {
    /// The 2048-bit MODP group 14 of RFC 3526 with generator 2.
    pub fn modp_2048() -> Self {
        // UNWRAP_SAFE: the constant is valid hex
        let p = BigUint::parse_bytes(MODP_2048_PRIME_HEX, 16).unwrap();
        Self {
            p,
            g: BigUint::from(2_u8),
        }
    }

    /// Sanity-checks parameters received over the wire.
    ///
    /// Rejects a modulus below 2048 bits or an even one, and a generator
    /// outside `(1, p)`. This does not prove primality; the parameters are
    /// expected to be a well-known group.
    pub fn validate(&self) -> Result<(), CryptoError> {
        let one = BigUint::from(1_u8);
        if self.p.bits() < 2048 || (&self.p % 2_u8) != one {
            return Err(CryptoError::InvalidParams);
        }
        if self.g <= one || self.g >= self.p {
            return Err(CryptoError::InvalidParams);
        }
        Ok(())
    }
}

/// An ephemeral Diffie-Hellman keypair.
///
/// The private exponent never leaves this struct; the only outputs are the
/// public value bytes and the derived [`SessionKey`].
pub struct DhKeyPair {
    params: DhParams,
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Generates a fresh keypair with a 256-bit private exponent.
    pub fn generate(params: &DhParams) -> Self {
        let one = BigUint::from(1_u8);
        let mut private = BigUint::from_bytes_be(&randombytes(32));
        while private <= one {
            private = BigUint::from_bytes_be(&randombytes(32));
        }
        let public = params.g.modpow(&private, &params.p);
        Self {
            params: params.clone(),
            private,
            public,
        }
    }

    /// The public value as big-endian bytes, ready for the wire.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Derives the session key shared with the peer that published
    /// `peer_bytes`.
    ///
    /// The peer value must lie strictly between 1 and `p-1` and inside the
    /// prime-order subgroup (`y^((p-1)/2) = 1 mod p`); anything else fails
    /// with [`CryptoError::OutOfGroup`].
    pub fn agree(&self, peer_bytes: &[u8]) -> Result<SessionKey, CryptoError> {
        let one = BigUint::from(1_u8);
        let peer = BigUint::from_bytes_be(peer_bytes);
        if peer <= one || peer >= &self.params.p - &one {
            return Err(CryptoError::OutOfGroup);
        }
        let q = (&self.params.p - &one) / 2_u8;
        if peer.modpow(&q, &self.params.p) != one {
            return Err(CryptoError::OutOfGroup);
        }
        let shared = peer.modpow(&self.private, &self.params.p);
        Ok(SessionKey::derive(&shared.to_bytes_be()))
    }
}

/// A pairwise session key.
///
/// Wraps a libsodium seed so the key material is zeroized on drop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKey(box_::Seed);

impl SessionKey {
    /// Derives a session key by hashing the shared-secret bytes.
    pub fn derive(shared: &[u8]) -> Self {
        Self(box_::Seed(sha256::hash(shared).0))
    }

    pub fn as_slice(&self) -> &[u8] {
        &(self.0).0
    }
}
