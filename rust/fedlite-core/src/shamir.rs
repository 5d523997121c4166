//! Threshold secret sharing over a prime field.
//!
//! A secret `S < p` is hidden as the constant term of a random polynomial of degree `t - 1`
//!
//! ```no_rust
//! f(x) = S + a1 * x + ... + a(t-1) * x^(t-1)  (mod p)
//! ```
//!
//! and share `i` is the point `(i, f(i))` for `i` in `1..=n`. Any `t` shares recover `S` by
//! Lagrange interpolation at zero, fewer than `t` shares reveal nothing about it.

use std::collections::HashSet;

use num::{
    bigint::BigUint,
    traits::{One, Zero},
};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{common::ConfigError, crypto::generate_integer};

/// The prime modulus of the field the shares live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeModulus(BigUint);

impl PrimeModulus {
    /// Reads the modulus from its big endian byte representation, as delivered by the server.
    ///
    /// # Errors
    /// Fails if the bytes are empty or encode a number smaller than 3.
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.is_empty() {
            return Err(ConfigError::Missing("prime"));
        }
        let prime = BigUint::from_bytes_be(bytes);
        if prime <= BigUint::from(2_u8) {
            return Err(ConfigError::out_of_range(
                "prime",
                format!("{} is too small to be a field modulus", prime),
            ));
        }
        Ok(Self(prime))
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Number of bits of the modulus.
    pub fn bits(&self) -> u64 {
        self.0.bits()
    }
}

impl From<BigUint> for PrimeModulus {
    fn from(prime: BigUint) -> Self {
        Self(prime)
    }
}

/// A point on the sharing polynomial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Share {
    /// The evaluation point, starting at 1.
    pub index: u32,
    /// The value of the polynomial at `index`.
    pub value: BigUint,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharingError {
    #[error("the secret doesn't fit in the field")]
    SecretTooLarge,
    #[error("invalid threshold {threshold} for {shares} shares")]
    InvalidThreshold { threshold: usize, shares: usize },
    #[error("insufficient shares: got {got}, need {needed}")]
    InsufficientShares { got: usize, needed: usize },
    #[error("share index {0} is used more than once")]
    DuplicateIndex(u32),
    #[error("share index 0 would reveal the secret")]
    ZeroIndex,
}

/// Splits `secret` into `shares` shares, any `threshold` of which recover it.
pub fn split(
    secret: &BigUint,
    threshold: usize,
    shares: usize,
    prime: &PrimeModulus,
    prng: &mut ChaCha20Rng,
) -> Result<Vec<Share>, SharingError> {
    let p = prime.as_biguint();
    if secret >= p {
        return Err(SharingError::SecretTooLarge);
    }
    if threshold == 0 || threshold > shares || shares > u32::MAX as usize {
        return Err(SharingError::InvalidThreshold { threshold, shares });
    }

    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(secret.clone());
    coefficients.extend(std::iter::repeat_with(|| generate_integer(prng, p)).take(threshold - 1));

    Ok((1..=shares as u32)
        .map(|index| Share {
            index,
            value: evaluate(&coefficients, &BigUint::from(index), p),
        })
        .collect())
}

/// Recovers the secret from at least `threshold` shares.
///
/// Only the first `threshold` shares are used.
pub fn combine(
    shares: &[Share],
    threshold: usize,
    prime: &PrimeModulus,
) -> Result<BigUint, SharingError> {
    if threshold == 0 {
        return Err(SharingError::InvalidThreshold {
            threshold,
            shares: shares.len(),
        });
    }
    if shares.len() < threshold {
        return Err(SharingError::InsufficientShares {
            got: shares.len(),
            needed: threshold,
        });
    }
    let points = &shares[..threshold];
    let mut seen = HashSet::with_capacity(threshold);
    for share in points {
        if share.index == 0 {
            return Err(SharingError::ZeroIndex);
        }
        if !seen.insert(share.index) {
            return Err(SharingError::DuplicateIndex(share.index));
        }
    }

    let p = prime.as_biguint();
    let mut secret = BigUint::zero();
    for (i, share_i) in points.iter().enumerate() {
        let x_i = BigUint::from(share_i.index) % p;
        // Lagrange basis polynomial l_i(0) = prod_{j != i} x_j / (x_j - x_i)
        let mut numerator = BigUint::one();
        let mut denominator = BigUint::one();
        for (j, share_j) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            let x_j = BigUint::from(share_j.index) % p;
            numerator = numerator * &x_j % p;
            denominator = denominator * ((&x_j + p - &x_i) % p) % p;
        }
        let basis = numerator * inverse(&denominator, p) % p;
        secret = (secret + (&share_i.value % p) * basis) % p;
    }
    Ok(secret)
}

/// Horner evaluation of the polynomial at `x`.
fn evaluate(coefficients: &[BigUint], x: &BigUint, p: &BigUint) -> BigUint {
    coefficients
        .iter()
        .rev()
        .fold(BigUint::zero(), |acc, coefficient| {
            (acc * x + coefficient) % p
        })
}

/// Modular inverse for a prime modulus, `a^(p - 2) mod p`.
fn inverse(a: &BigUint, p: &BigUint) -> BigUint {
    a.modpow(&(p - BigUint::from(2_u8)), p)
}
