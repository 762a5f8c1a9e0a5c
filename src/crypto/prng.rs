use num::bigint::BigUint;
use rand::RngCore;
use rand_chacha::ChaCha20Rng;

/// Generates a random integer in the range `[0, max_int)` from the provided
/// PRNG.
///
/// Rejection sampling over the byte width of `max_int` keeps the output
/// uniform; no modular reduction bias is introduced.
pub fn generate_integer(prng: &mut ChaCha20Rng, max_int: &BigUint) -> BigUint {
    use num::traits::Zero;
    if max_int.is_zero() {
        return BigUint::zero();
    }
    let mut bytes = max_int.to_bytes_le();
    let mut rand_int = BigUint::from_bytes_le(&bytes);
    while &rand_int >= max_int {
        prng.fill_bytes(&mut bytes);
        rand_int = BigUint::from_bytes_le(&bytes);
    }
    rand_int
}
