//! `Ed25519` identity proofs.
//!
//! A client may sign `fl_id ‖ timestamp ‖ iteration` when it asks to join a round. The
//! coordinator checks the proof against the public key the client registered with.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use std::convert::TryFrom;

use derive_more::{AsRef, From};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sodiumoxide::crypto::sign;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// The identity keys of a client.
pub struct SigningKeyPair {
    pub public: PublicSigningKey,
    pub secret: SecretSigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let (pk, sk) = sign::gen_keypair();
        Self {
            public: PublicSigningKey(pk),
            secret: SecretSigningKey(sk),
        }
    }

    /// Signs the identity message of a join request.
    pub fn prove(&self, fl_id: &str, timestamp: u64, iteration: u64) -> Signature {
        self.secret.sign_detached(&identity_message(fl_id, timestamp, iteration))
    }
}

#[derive(AsRef, From, Serialize, Deserialize, Hash, Eq, PartialEq, Copy, Clone, Debug)]
pub struct PublicSigningKey(sign::PublicKey);

impl PublicSigningKey {
    /// Whether `signature` is a valid signature of `message` under this key.
    pub fn verify_detached(&self, signature: &Signature, message: &[u8]) -> bool {
        sign::verify_detached(&signature.0, message, &self.0)
    }

    /// Checks an identity proof made with [`SigningKeyPair::prove`].
    pub fn verify(&self, signature: &Signature, fl_id: &str, timestamp: u64, iteration: u64) -> bool {
        self.verify_detached(signature, &identity_message(fl_id, timestamp, iteration))
    }
}

#[derive(AsRef, From, Serialize, Deserialize, Eq, PartialEq, Clone, Debug)]
/// Zeroed out when dropped.
pub struct SecretSigningKey(sign::SecretKey);

impl SecretSigningKey {
    pub fn sign_detached(&self, message: &[u8]) -> Signature {
        Signature(sign::sign_detached(message, &self.0))
    }
}

#[derive(AsRef, From, Eq, PartialEq, Copy, Clone, Debug)]
/// An `Ed25519` signature detached from its message.
pub struct Signature(sign::Signature);

// sodiumoxide doesn't serialize signatures
impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes: &[u8] = self.0.as_ref();
        bytes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        sign::Signature::try_from(bytes.as_slice())
            .map(Self)
            .map_err(|_| {
                D::Error::custom(format!(
                    "invalid signature length {}, expected {}",
                    bytes.len(),
                    sign::SIGNATUREBYTES
                ))
            })
    }
}

/// The message a client signs to prove its identity when joining a round.
pub fn identity_message(fl_id: &str, timestamp: u64, iteration: u64) -> Vec<u8> {
    let mut message = Vec::with_capacity(fl_id.len() + 16);
    message.extend_from_slice(fl_id.as_bytes());
    message.extend_from_slice(&timestamp.to_le_bytes());
    message.extend_from_slice(&iteration.to_le_bytes());
    message
}
