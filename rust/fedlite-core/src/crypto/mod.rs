//! Wrappers around some of the [sodiumoxide] crypto primitives.
//!
//! The wrappers provide methods defined on structs instead of the sodiumoxide functions. This is
//! done for the `C25519` key pairs used for share transport and pairwise key agreement, the
//! `Ed25519` key pairs used to prove the identity of a client, and the `SHA256` hash function.
//!
//! # Examples
//! ## Key agreement
//! ```
//! # use fedlite_core::crypto::EncryptKeyPair;
//! let alice = EncryptKeyPair::generate();
//! let bob = EncryptKeyPair::generate();
//! let ab = alice.secret.agree(&bob.public).unwrap();
//! let ba = bob.secret.agree(&alice.public).unwrap();
//! assert_eq!(ab, ba);
//! ```
//!
//! ## Encryption of messages
//! ```
//! # use fedlite_core::crypto::EncryptKeyPair;
//! let keys = EncryptKeyPair::generate();
//! let message = b"Hello world!".to_vec();
//! let cipher = keys.public.encrypt(&message);
//! assert_eq!(message, keys.secret.decrypt(&cipher, &keys.public).unwrap());
//! ```
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/

pub(crate) mod encrypt;
pub(crate) mod hash;
pub(crate) mod prng;
pub(crate) mod sign;

use sodiumoxide::randombytes::randombytes;

pub use self::{
    encrypt::{
        AgreementError,
        DecryptionError,
        EncryptKeyPair,
        PublicEncryptKey,
        SecretEncryptKey,
        SharedSecret,
        SEALBYTES,
    },
    hash::Sha256,
    prng::{generate_integer, secure_prng},
    sign::{identity_message, PublicSigningKey, SecretSigningKey, Signature, SigningKeyPair},
};

/// Fixed length byte strings: keys, digests and seeds.
pub trait ByteObject: Sized {
    const LENGTH: usize;

    /// All bytes set to `0`.
    fn zeroed() -> Self;

    fn as_slice(&self) -> &[u8];

    /// `None` unless `bytes` is exactly [`Self::LENGTH`] long.
    fn from_slice(bytes: &[u8]) -> Option<Self>;

    /// Like [`from_slice`](Self::from_slice), for callers that already checked the length.
    ///
    /// # Panics
    /// On a length mismatch.
    fn from_slice_unchecked(bytes: &[u8]) -> Self {
        match Self::from_slice(bytes) {
            Some(object) => object,
            None => panic!("expected {} bytes, got {}", Self::LENGTH, bytes.len()),
        }
    }

    /// Random bytes from the sodiumoxide CSPRNG.
    fn generate() -> Self {
        Self::from_slice_unchecked(&randombytes(Self::LENGTH))
    }

    /// Every byte set to `value`.
    fn fill_with(value: u8) -> Self {
        Self::from_slice_unchecked(&vec![value; Self::LENGTH])
    }
}
