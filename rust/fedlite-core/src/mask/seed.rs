//! Mask seed and mask generation.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::iter;

use derive_more::{AsMut, AsRef};
use num::bigint::BigUint;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::box_;

use crate::crypto::ByteObject;

/// Granularity of the mask values.
pub const MASK_RESOLUTION: f32 = 1.0 / 65_536.0;

#[derive(AsRef, AsMut, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// A seed to generate a mask.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct MaskSeed(box_::Seed);

impl ByteObject for MaskSeed {
    const LENGTH: usize = box_::SEEDBYTES;

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::Seed::from_slice(bytes).map(Self)
    }

    fn zeroed() -> Self {
        Self(box_::Seed([0_u8; Self::LENGTH]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl MaskSeed {
    /// Gets this seed as an array.
    pub fn as_array(&self) -> [u8; Self::LENGTH] {
        (self.0).0
    }

    /// Reads the seed from an integer, as recovered from secret shares.
    ///
    /// Returns `None` if the integer doesn't fit in [`MaskSeed::LENGTH`] bytes.
    pub fn from_integer(int: &BigUint) -> Option<Self> {
        let bytes = int.to_bytes_be();
        if bytes.len() > Self::LENGTH {
            return None;
        }
        let mut array = [0_u8; Self::LENGTH];
        array[Self::LENGTH - bytes.len()..].copy_from_slice(&bytes);
        Self::from_slice(&array)
    }

    /// Gets the seed as an integer, so that it can be secret shared.
    pub fn to_integer(&self) -> BigUint {
        BigUint::from_bytes_be(self.as_slice())
    }

    /// Derives a mask of the given length from this seed.
    pub fn derive_mask(&self, len: usize) -> Vec<f32> {
        let mut prng = ChaCha20Rng::from_seed(self.as_array());
        iter::repeat_with(|| mask_value(prng.next_u32()))
            .take(len)
            .collect()
    }
}

/// Maps 17 random bits to a multiple of [`MASK_RESOLUTION`] in `[-1, 1)`.
fn mask_value(random: u32) -> f32 {
    (random >> 15) as f32 * MASK_RESOLUTION - 1.0
}
