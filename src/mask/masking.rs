//! The random-padding cipher and the Arbiter-side aggregation.
//!
//! One pad stream exists per (session key, domain, suffix) triple. The
//! Guest holds one session key per Host and adds every pad; each Host holds
//! the single key it shares with the Guest and subtracts the same pad. In
//! the modular sum over all parties every pad appears once with each sign,
//! so the Arbiter recovers the plain sum without seeing any contribution.

use num::bigint::BigUint;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::hash::sha256;
use thiserror::Error;

use super::{config::MaskConfig, model::Model};
use crate::{
    crypto::{generate_integer, SessionKey},
    transfer::transport::Suffix,
};

/// An error related to encoding a contribution.
#[derive(Debug, Error)]
pub enum MaskError {
    #[error("weight {0} is not finite and cannot be encoded")]
    NotFinite(f64),
}

/// An error related to aggregating masked contributions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("the contribution was encoded with a different mask configuration")]
    ConfigMismatch,

    #[error("the contribution length does not match the aggregate")]
    LengthMismatch,

    #[error("the aggregate cannot absorb further contributions")]
    TooManyContributions,

    #[error("no contribution has been aggregated")]
    Empty,
}

/// A masked model contribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskedModel {
    pub config: MaskConfig,
    pub data: Vec<BigUint>,
}

/// A masked scalar contribution, e.g. a training loss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskedScalar {
    pub config: MaskConfig,
    pub data: BigUint,
}

/// Domain separation tag between the pad streams of one round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskDomain {
    Model,
    Loss,
}

impl MaskDomain {
    fn tag(self) -> &'static [u8] {
        match self {
            MaskDomain::Model => b"model",
            MaskDomain::Loss => b"loss",
        }
    }
}

/// Seeds the pad stream of one (key, domain, suffix) triple.
fn mask_prng(key: &SessionKey, domain: MaskDomain, suffix: &Suffix) -> ChaCha20Rng {
    let mut input = Vec::with_capacity(key.as_slice().len() + 8 * suffix.as_slice().len() + 8);
    input.extend_from_slice(key.as_slice());
    input.extend_from_slice(domain.tag());
    for word in suffix.as_slice() {
        input.extend_from_slice(&word.to_le_bytes());
    }
    ChaCha20Rng::from_seed(sha256::hash(&input).0)
}

/// Which side of the pad cancellation a party is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadSign {
    Add,
    Subtract,
}

/// The party-side pad cipher.
///
/// Pads are never stored; they are regenerated from the session keys for
/// every `(domain, suffix)` and folded into the encoded contribution on the
/// fly.
pub struct PadCipher {
    config: MaskConfig,
    sign: PadSign,
    keys: Vec<SessionKey>,
}

impl PadCipher {
    /// The Guest cipher: adds one pad stream per Host key.
    pub fn guest(config: MaskConfig, keys: Vec<SessionKey>) -> Self {
        Self {
            config,
            sign: PadSign::Add,
            keys,
        }
    }

    /// A Host cipher: subtracts the single pad stream it shares with the
    /// Guest.
    pub fn host(config: MaskConfig, key: SessionKey) -> Self {
        Self {
            config,
            sign: PadSign::Subtract,
            keys: vec![key],
        }
    }

    pub fn config(&self) -> MaskConfig {
        self.config
    }

    fn pad(&self, value: BigUint, pad: &BigUint, order: &BigUint) -> BigUint {
        match self.sign {
            PadSign::Add => (value + pad) % order,
            PadSign::Subtract => (value + order - pad) % order,
        }
    }

    /// Encodes and masks a weighted model contribution for one round.
    pub fn encrypt_model(
        &self,
        model: &Model,
        weight: f64,
        suffix: &Suffix,
    ) -> Result<MaskedModel, MaskError> {
        let order = self.config.order();
        let mut data = model
            .iter()
            .map(|value| self.config.encode(value * weight))
            .collect::<Result<Vec<_>, _>>()?;
        for key in &self.keys {
            let mut prng = mask_prng(key, MaskDomain::Model, suffix);
            for value in data.iter_mut() {
                let pad = generate_integer(&mut prng, &order);
                *value = self.pad(value.clone(), &pad, &order);
            }
        }
        Ok(MaskedModel {
            config: self.config,
            data,
        })
    }

    /// Encodes and masks a weighted scalar contribution for one round.
    pub fn encrypt_loss(
        &self,
        loss: f64,
        weight: f64,
        suffix: &Suffix,
    ) -> Result<MaskedScalar, MaskError> {
        let order = self.config.order();
        let mut data = self.config.encode(loss * weight)?;
        for key in &self.keys {
            let mut prng = mask_prng(key, MaskDomain::Loss, suffix);
            let pad = generate_integer(&mut prng, &order);
            data = self.pad(data, &pad, &order);
        }
        Ok(MaskedScalar {
            config: self.config,
            data,
        })
    }
}

/// The Arbiter-side modular sum of masked contributions.
pub struct Aggregation {
    config: MaskConfig,
    nb_contributions: usize,
    data: Option<Vec<BigUint>>,
}

impl Aggregation {
    pub fn new(config: MaskConfig) -> Self {
        Self {
            config,
            nb_contributions: 0,
            data: None,
        }
    }

    pub fn nb_contributions(&self) -> usize {
        self.nb_contributions
    }

    fn validate(&self, config: MaskConfig, len: usize) -> Result<(), AggregationError> {
        if config != self.config {
            return Err(AggregationError::ConfigMismatch);
        }
        if let Some(data) = &self.data {
            if data.len() != len {
                return Err(AggregationError::LengthMismatch);
            }
        }
        if self.nb_contributions >= self.config.max_parties as usize {
            return Err(AggregationError::TooManyContributions);
        }
        Ok(())
    }

    fn fold(&mut self, contribution: &[BigUint]) {
        let order = self.config.order();
        match &mut self.data {
            Some(data) => {
                for (acc, value) in data.iter_mut().zip(contribution) {
                    *acc = (&*acc + value) % &order;
                }
            }
            None => self.data = Some(contribution.to_vec()),
        }
        self.nb_contributions += 1;
    }

    /// Absorbs one masked model contribution.
    pub fn aggregate_model(&mut self, masked: &MaskedModel) -> Result<(), AggregationError> {
        self.validate(masked.config, masked.data.len())?;
        self.fold(&masked.data);
        Ok(())
    }

    /// Absorbs one masked scalar contribution.
    pub fn aggregate_loss(&mut self, masked: &MaskedScalar) -> Result<(), AggregationError> {
        self.validate(masked.config, 1)?;
        self.fold(std::slice::from_ref(&masked.data));
        Ok(())
    }

    /// Decodes the aggregate into a plain model.
    pub fn into_model(self) -> Result<Model, AggregationError> {
        let data = self.data.ok_or(AggregationError::Empty)?;
        let config = self.config;
        let nb_contributions = self.nb_contributions;
        Ok(data
            .iter()
            .map(|value| config.decode(value, nb_contributions))
            .collect())
    }

    /// Decodes the aggregate into a plain scalar.
    pub fn into_loss(self) -> Result<f64, AggregationError> {
        let data = self.data.ok_or(AggregationError::Empty)?;
        if data.len() != 1 {
            return Err(AggregationError::LengthMismatch);
        }
        Ok(self.config.decode(&data[0], self.nb_contributions))
    }
}
