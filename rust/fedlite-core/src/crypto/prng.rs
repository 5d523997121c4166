//! Secure randomness for keys, seeds and secret sharing.

use num::{bigint::BigUint, traits::identities::Zero};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sodiumoxide::randombytes::randombytes_into;

/// Creates a `ChaCha20` PRNG seeded from the operating system's secure random source.
pub fn secure_prng() -> ChaCha20Rng {
    let mut seed = [0_u8; 32];
    randombytes_into(&mut seed);
    ChaCha20Rng::from_seed(seed)
}

/// Draws an integer uniformly from `0..bound` by rejection sampling. A zero bound gives zero.
pub fn generate_integer(prng: &mut ChaCha20Rng, bound: &BigUint) -> BigUint {
    if bound.is_zero() {
        return BigUint::zero();
    }
    let mut bytes = vec![0_u8; ((bound.bits() + 7) / 8) as usize];
    // clear the bits above the bound so that at least half of the draws are kept
    let top_mask = 0xff_u8 >> ((8 - bound.bits() % 8) % 8);
    loop {
        prng.fill_bytes(&mut bytes);
        bytes[0] &= top_mask;
        let candidate = BigUint::from_bytes_be(&bytes);
        if &candidate < bound {
            return candidate;
        }
    }
}
