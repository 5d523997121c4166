//! Share transport (sealed boxes) and pairwise key agreement over `Curve25519`.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use derive_more::{AsMut, AsRef, From};
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::{box_, scalarmult::curve25519, sealedbox};

use super::ByteObject;

/// Number of additional bytes in a ciphertext compared to the corresponding plaintext.
pub const SEALBYTES: usize = sealedbox::SEALBYTES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A `C25519` key pair. A client holds two per round: one to receive shares and one to agree
/// on pairwise mask secrets.
pub struct EncryptKeyPair {
    pub public: PublicEncryptKey,
    pub secret: SecretEncryptKey,
}

impl EncryptKeyPair {
    pub fn generate() -> Self {
        let (pk, sk) = box_::gen_keypair();
        Self {
            public: PublicEncryptKey(pk),
            secret: SecretEncryptKey(sk),
        }
    }

    /// Rebuilds a key pair from a secret key, e.g. one recovered from shares.
    pub fn from_secret(secret: SecretEncryptKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }
}

#[derive(AsRef, From, Serialize, Deserialize, Hash, Eq, PartialEq, Copy, Clone, Debug)]
pub struct PublicEncryptKey(box_::PublicKey);

impl PublicEncryptKey {
    /// Seals `message` for the owner of this key. The ciphertext is [`SEALBYTES`] longer than
    /// the message.
    pub fn encrypt(&self, message: &[u8]) -> Vec<u8> {
        sealedbox::seal(message, &self.0)
    }
}

impl ByteObject for PublicEncryptKey {
    const LENGTH: usize = box_::PUBLICKEYBYTES;

    fn zeroed() -> Self {
        Self(box_::PublicKey([0_u8; Self::LENGTH]))
    }

    fn as_slice(&self) -> &[u8] {
        &(self.0).0
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::PublicKey::from_slice(bytes).map(Self)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("the ciphertext could not be opened")]
pub struct DecryptionError;

#[derive(thiserror::Error, Debug)]
#[error("key agreement failed: the peer public key is a low order point")]
pub struct AgreementError;

#[derive(AsRef, AsMut, From, Serialize, Deserialize, Eq, PartialEq, Clone, Debug)]
/// Zeroed out when dropped.
pub struct SecretEncryptKey(box_::SecretKey);

impl SecretEncryptKey {
    /// Opens a ciphertext sealed for `pk`, the public key of this secret key.
    pub fn decrypt(&self, cipher: &[u8], pk: &PublicEncryptKey) -> Result<Vec<u8>, DecryptionError> {
        sealedbox::open(cipher, &pk.0, &self.0).map_err(|_| DecryptionError)
    }

    pub fn public_key(&self) -> PublicEncryptKey {
        PublicEncryptKey(self.0.public_key())
    }

    /// `X25519` agreement with the owner of `pk`. Both sides obtain the same secret.
    ///
    /// # Errors
    /// Fails for low order public keys, for which the result is the neutral element.
    pub fn agree(&self, pk: &PublicEncryptKey) -> Result<SharedSecret, AgreementError> {
        let scalar = curve25519::Scalar(self.0 .0);
        let point = curve25519::GroupElement(pk.0 .0);
        curve25519::scalarmult(&scalar, &point)
            .map(|shared| SharedSecret(shared.0))
            .map_err(|_| AgreementError)
    }
}

impl ByteObject for SecretEncryptKey {
    const LENGTH: usize = box_::SECRETKEYBYTES;

    fn zeroed() -> Self {
        Self(box_::SecretKey([0_u8; Self::LENGTH]))
    }

    fn as_slice(&self) -> &[u8] {
        &(self.0).0
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::SecretKey::from_slice(bytes).map(Self)
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug)]
/// A secret agreed on by two clients.
pub struct SharedSecret([u8; curve25519::GROUPELEMENTBYTES]);

impl ByteObject for SharedSecret {
    const LENGTH: usize = curve25519::GROUPELEMENTBYTES;

    fn zeroed() -> Self {
        Self([0_u8; Self::LENGTH])
    }

    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        let mut array = [0_u8; Self::LENGTH];
        if bytes.len() != Self::LENGTH {
            return None;
        }
        array.copy_from_slice(bytes);
        Some(Self(array))
    }
}
