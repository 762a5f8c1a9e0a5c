use num::{
    bigint::{BigInt, BigUint},
    clamp,
    rational::Ratio,
    traits::{Pow, ToPrimitive},
};
use serde::{Deserialize, Serialize};

use super::masking::MaskError;

/// Parameters of the finite group the masking arithmetic runs in.
///
/// Weights are clamped to `[-bound, bound]`, shifted into the nonnegative
/// range and scaled by `10^precision` before truncation, so each encoded
/// element lies in `[0, 2 * bound * 10^precision]`. The group order leaves
/// room for `max_parties` contributions, which makes the modular sum of
/// encoded elements equal to their integer sum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskConfig {
    /// Number of decimal fraction digits preserved by the encoding.
    pub precision: u32,
    /// Symmetric clamping bound on the absolute value of a weight.
    pub bound: u32,
    /// Upper bound on the number of summed contributions.
    pub max_parties: u32,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            precision: 8,
            bound: 1_000_000,
            max_parties: 1000,
        }
    }
}

impl MaskConfig {
    /// The order of the additive group: `2 * bound * 10^precision *
    /// max_parties + 1`.
    pub fn order(&self) -> BigUint {
        BigUint::from(2_u8) * self.bound * Pow::pow(BigUint::from(10_u8), self.precision)
            * self.max_parties
            + 1_u8
    }

    /// The exponential shift `10^precision` scaling fractions to integers.
    fn exp_shift(&self) -> Ratio<BigInt> {
        Ratio::from_integer(Pow::pow(BigInt::from(10), self.precision))
    }

    /// The additive shift moving `[-bound, bound]` to `[0, 2 * bound]`.
    fn add_shift(&self) -> Ratio<BigInt> {
        Ratio::from_integer(BigInt::from(self.bound))
    }

    /// Encodes one weight as a group element.
    ///
    /// Non-finite values cannot be represented and fail; values beyond the
    /// bound are clamped to it.
    pub fn encode(&self, value: f64) -> Result<BigUint, MaskError> {
        let value = Ratio::from_float(value).ok_or(MaskError::NotFinite(value))?;
        let add_shift = self.add_shift();
        let clamped = clamp(value, -add_shift.clone(), add_shift.clone());
        let scaled = (clamped + add_shift) * self.exp_shift();
        // PANIC_SAFE: the additive shift makes the scaled value nonnegative
        Ok(scaled.to_integer().to_biguint().unwrap())
    }

    /// Decodes the sum of `nb_contributions` encoded weights.
    ///
    /// Each contribution carried one additive shift, so `nb_contributions`
    /// shifts are removed before scaling back down.
    pub fn decode(&self, value: &BigUint, nb_contributions: usize) -> f64 {
        let unshifted = Ratio::from_integer(BigInt::from(value.clone())) / self.exp_shift()
            - self.add_shift() * BigInt::from(nb_contributions as u64);
        unshifted.to_f64().unwrap_or(f64::NAN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MaskConfig {
        MaskConfig {
            precision: 6,
            bound: 1000,
            max_parties: 8,
        }
    }

    #[test]
    fn test_order() {
        assert_eq!(
            config().order(),
            BigUint::from(16_000_000_000_001_u64),
        );
    }

    #[test]
    fn test_encode_decode_is_exact_for_representable_values() {
        let config = config();
        for &value in &[0.0, 1.25, -0.5, 999.999999, -1000.0] {
            let encoded = config.encode(value).unwrap();
            assert_eq!(config.decode(&encoded, 1), value);
        }
    }

    #[test]
    fn test_encode_clamps_out_of_bound_values() {
        let config = config();
        let encoded = config.encode(1e12).unwrap();
        assert_eq!(config.decode(&encoded, 1), 1000.0);
        let encoded = config.encode(-1e12).unwrap();
        assert_eq!(config.decode(&encoded, 1), -1000.0);
    }

    #[test]
    fn test_encode_rejects_non_finite_values() {
        let config = config();
        for &value in &[f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                config.encode(value),
                Err(MaskError::NotFinite(_))
            ));
        }
    }

    #[test]
    fn test_decode_removes_one_shift_per_contribution() {
        let config = config();
        let sum = config.encode(1.5).unwrap() + config.encode(2.25).unwrap();
        assert_eq!(config.decode(&sum, 2), 3.75);
    }
}
