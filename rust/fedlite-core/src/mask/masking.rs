//! Pairwise seeds, combined masks and masking of features.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::cmp::Ordering;

use derive_more::{AsRef, From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crypto::{ByteObject, Sha256, SharedSecret},
    mask::MaskSeed,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MaskError {
    #[error("the feature mask is empty")]
    EmptyMask,
    #[error("the feature mask of length {mask_len} cannot cover {len} values at offset {offset}")]
    OutOfRange {
        mask_len: usize,
        offset: usize,
        len: usize,
    },
}

/// Derives the seed of the mask shared by two clients for the given iteration.
pub fn pairwise_seed(secret: &SharedSecret, iteration: u64) -> MaskSeed {
    let digest = Sha256::hash_parts(&[secret.as_slice(), &iteration.to_le_bytes()]);
    // safe unwrap: a SHA256 digest has the length of a seed
    MaskSeed::from_slice_unchecked(digest.as_slice())
}

/// Whether a client adds or subtracts the mask it shares with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSign {
    Add,
    Subtract,
}

impl PairSign {
    /// The client with the smaller identifier adds, the other one subtracts.
    ///
    /// Returns `None` for identical identifiers: a client shares no mask with itself.
    pub fn between(own: &str, peer: &str) -> Option<Self> {
        match own.cmp(peer) {
            Ordering::Less => Some(Self::Add),
            Ordering::Greater => Some(Self::Subtract),
            Ordering::Equal => None,
        }
    }
}

/// The combined mask of a client: its individual mask plus the signed pairwise masks.
#[derive(Debug, Clone, PartialEq, AsRef, From, Into, Serialize, Deserialize)]
pub struct FeatureMask(Vec<f32>);

impl FeatureMask {
    /// Creates a mask of zeros.
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Adds `other` element-wise with the given sign.
    ///
    /// # Panics
    /// Panics if the lengths differ.
    pub fn accumulate(&mut self, other: &[f32], sign: PairSign) {
        assert_eq!(self.0.len(), other.len(), "mask lengths differ");
        match sign {
            PairSign::Add => self.0.iter_mut().zip(other).for_each(|(m, o)| *m += o),
            PairSign::Subtract => self.0.iter_mut().zip(other).for_each(|(m, o)| *m -= o),
        }
    }
}

/// Masks one feature of the update.
///
/// Computes `feature[j] * train_data_size + mask[offset + j]`, where `offset` is the position of
/// the feature in the flattened update.
///
/// # Errors
/// Fails if the mask is empty or too short to cover the feature.
pub fn mask_weight(
    train_data_size: u32,
    feature: &[f32],
    mask: &FeatureMask,
    offset: usize,
) -> Result<Vec<f32>, MaskError> {
    if mask.is_empty() {
        return Err(MaskError::EmptyMask);
    }
    let end = offset
        .checked_add(feature.len())
        .filter(|end| *end <= mask.len())
        .ok_or(MaskError::OutOfRange {
            mask_len: mask.len(),
            offset,
            len: feature.len(),
        })?;
    let scale = train_data_size as f32;
    Ok(feature
        .iter()
        .zip(&mask.as_slice()[offset..end])
        .map(|(value, m)| value * scale + m)
        .collect())
}

/// Removes a mask from masked values.
pub fn unmask(masked: &[f32], mask: &[f32]) -> Vec<f32> {
    masked.iter().zip(mask).map(|(v, m)| v - m).collect()
}
