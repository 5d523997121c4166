//! The client half of the pairwise masking secure aggregation protocol.
//!
//! Each iteration a client runs four exchanges with the server:
//!
//! 1. **key exchange**: it publishes two public keys, one (`c`) to receive secret shares and one
//!    (`s`) to agree on pairwise mask seeds, and fetches the keys of its peers.
//! 2. **secret sharing**: it splits its individual mask seed `b` and its agreement secret key
//!    `s_sk` into shares, one per peer, and sends each peer its shares encrypted to the peer's
//!    `c` key.
//! 3. **double masking**: it derives one mask per peer from the agreed pairwise secrets, adds it
//!    with a sign that depends on the ordering of the identifiers, and adds its individual mask.
//! 4. **reconstruction**: once the server knows which clients uploaded, the client reveals the
//!    `b` shares of the survivors and the `s_sk` shares of the clients that dropped out.
//!
//! With the revealed shares, the server removes the individual masks of the survivors and the
//! pairwise masks that the survivors share with dropped clients. The pairwise masks between two
//! survivors cancel out in the sum. The helpers [`recover_individual_mask`] and
//! [`recover_pairwise_masks`] implement the server side of the last step.

use std::collections::{BTreeMap, HashSet};

use num::bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    common::ConfigError,
    crypto::{
        generate_integer,
        secure_prng,
        AgreementError,
        ByteObject,
        DecryptionError,
        EncryptKeyPair,
        PublicEncryptKey,
        SecretEncryptKey,
    },
    mask::{pairwise_seed, FeatureMask, MaskSeed, PairSign},
    shamir::{self, PrimeModulus, Share, SharingError},
    FlId,
};

/// Parameters of the pairwise masking protocol, as delivered by the server plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwConfig {
    /// Minimum number of shares needed to recover a secret.
    pub threshold: usize,
    /// Modulus of the field the secrets are shared in.
    pub prime: PrimeModulus,
    /// Total length of the flattened update, and thus of the mask.
    pub feature_size: usize,
}

impl PwConfig {
    /// Validates the protocol parameters.
    ///
    /// # Errors
    /// Fails if the prime is missing or too small, if the threshold isn't positive or if the
    /// feature size is zero.
    pub fn new(threshold: i32, prime: &[u8], feature_size: usize) -> Result<Self, ConfigError> {
        let prime = PrimeModulus::from_be_bytes(prime)?;
        if threshold <= 0 {
            return Err(ConfigError::out_of_range(
                "min_secret_num",
                format!("threshold must be positive, got {}", threshold),
            ));
        }
        if feature_size == 0 {
            return Err(ConfigError::out_of_range(
                "feature_size",
                "the mask must cover at least one value",
            ));
        }
        Ok(Self {
            threshold: threshold as usize,
            prime,
            feature_size,
        })
    }

    /// Exclusive upper bound of the shared secrets: the prime, capped at 2^256 so that every
    /// secret fits in 32 bytes.
    fn secret_bound(&self) -> BigUint {
        let max = BigUint::from(1_u8) << 256_usize;
        if self.prime.as_biguint() < &max {
            self.prime.as_biguint().clone()
        } else {
            max
        }
    }
}

#[derive(Debug, Error)]
pub enum SecAggError {
    #[error("the peer list doesn't contain this client")]
    MissingSelf,
    #[error("the peer list entry of this client doesn't match its keys")]
    ForeignKeys,
    #[error("not enough peers: got {got}, need at least {needed}")]
    TooFewPeers { got: usize, needed: usize },
    #[error("the peers of this iteration are not known yet")]
    PeersNotSet,
    #[error("unknown peer {0}")]
    UnknownPeer(FlId),
    #[error("share from {sender} is not addressed to {recipient}")]
    Misaddressed { sender: FlId, recipient: FlId },
    #[error("malformed share from {0}")]
    MalformedShare(FlId),
    #[error("this client is not among the survivors")]
    NotASurvivor,
    #[error("the recovered secret is not a valid key or seed")]
    InvalidSecret,
    #[error("failed to encode a share: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("secret sharing failed: {0}")]
    Sharing(#[from] SharingError),
    #[error(transparent)]
    Agreement(#[from] AgreementError),
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
}

/// The public keys a client publishes during the key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKeys {
    pub fl_id: FlId,
    /// Key the shares for this client are encrypted to.
    pub c_pk: PublicEncryptKey,
    /// Key the pairwise mask seeds are agreed with.
    pub s_pk: PublicEncryptKey,
}

/// A pair of shares sent from one client to another through the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedShare {
    pub sender: FlId,
    pub recipient: FlId,
    /// The sealed [`SharePayload`].
    pub cipher: Vec<u8>,
}

/// The plaintext of an [`EncryptedShare`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SharePayload {
    sender: FlId,
    recipient: FlId,
    seed_share: Share,
    key_share: Share,
}

/// Which secret a revealed share belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretKind {
    /// The individual mask seed `b` of a client that uploaded.
    IndividualSeed,
    /// The agreement secret key `s_sk` of a client that dropped out.
    AgreementKey,
}

/// A share revealed to the server during the reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedShare {
    /// The client the secret belongs to.
    pub owner: FlId,
    pub kind: SecretKind,
    pub share: Share,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HeldShares {
    seed_share: Share,
    key_share: Share,
}

/// The secure aggregation state of one client for one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherSession {
    fl_id: FlId,
    iteration: u64,
    config: PwConfig,
    c_keys: EncryptKeyPair,
    s_keys: EncryptKeyPair,
    seed: MaskSeed,
    /// Peers sorted by identifier, this client included.
    peers: Vec<ClientKeys>,
    /// Shares received from the peers, keyed by their owner.
    held: BTreeMap<FlId, HeldShares>,
}

impl CipherSession {
    /// Starts a session with fresh secrets.
    pub fn new(fl_id: FlId, iteration: u64, config: PwConfig) -> Result<Self, SecAggError> {
        let mut prng = secure_prng();
        let bound = config.secret_bound();

        let seed = MaskSeed::from_integer(&generate_integer(&mut prng, &bound))
            .ok_or(SecAggError::InvalidSecret)?;
        let s_sk = secret_key_from_integer(&generate_integer(&mut prng, &bound))
            .ok_or(SecAggError::InvalidSecret)?;

        Ok(Self {
            fl_id,
            iteration,
            config,
            c_keys: EncryptKeyPair::generate(),
            s_keys: EncryptKeyPair::from_secret(s_sk),
            seed,
            peers: Vec::new(),
            held: BTreeMap::new(),
        })
    }

    pub fn fl_id(&self) -> &str {
        &self.fl_id
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn config(&self) -> &PwConfig {
        &self.config
    }

    pub fn peers(&self) -> &[ClientKeys] {
        &self.peers
    }

    /// The keys published during the key exchange.
    pub fn public_keys(&self) -> ClientKeys {
        ClientKeys {
            fl_id: self.fl_id.clone(),
            c_pk: self.c_keys.public,
            s_pk: self.s_keys.public,
        }
    }

    /// Sets the peers of this iteration, as returned by the server after the key exchange.
    ///
    /// Duplicated identifiers are dropped, keeping the first entry.
    pub fn set_peers(&mut self, peers: Vec<ClientKeys>) -> Result<(), SecAggError> {
        let mut seen = HashSet::new();
        let mut peers: Vec<ClientKeys> = peers
            .into_iter()
            .filter(|peer| seen.insert(peer.fl_id.clone()))
            .collect();
        peers.sort_by(|a, b| a.fl_id.cmp(&b.fl_id));

        let own = peers
            .iter()
            .find(|peer| peer.fl_id == self.fl_id)
            .ok_or(SecAggError::MissingSelf)?;
        if own != &self.public_keys() {
            return Err(SecAggError::ForeignKeys);
        }
        if peers.len() < self.config.threshold {
            return Err(SecAggError::TooFewPeers {
                got: peers.len(),
                needed: self.config.threshold,
            });
        }
        debug!("secure aggregation with {} peers", peers.len());
        self.peers = peers;
        self.held.clear();
        Ok(())
    }

    /// Splits the secrets of this client and encrypts one pair of shares per peer.
    ///
    /// The share addressed to this client is kept locally instead of being returned.
    pub fn share_secrets(&mut self) -> Result<Vec<EncryptedShare>, SecAggError> {
        if self.peers.is_empty() {
            return Err(SecAggError::PeersNotSet);
        }
        let mut prng = secure_prng();
        let n = self.peers.len();
        let t = self.config.threshold;
        let prime = &self.config.prime;

        let seed_shares = shamir::split(&self.seed.to_integer(), t, n, prime, &mut prng)?;
        let key_int = BigUint::from_bytes_be(self.s_keys.secret.as_slice());
        let key_shares = shamir::split(&key_int, t, n, prime, &mut prng)?;

        let mut encrypted = Vec::with_capacity(n - 1);
        for ((peer, seed_share), key_share) in self.peers.iter().zip(seed_shares).zip(key_shares) {
            if peer.fl_id == self.fl_id {
                self.held.insert(
                    self.fl_id.clone(),
                    HeldShares {
                        seed_share,
                        key_share,
                    },
                );
                continue;
            }
            let payload = SharePayload {
                sender: self.fl_id.clone(),
                recipient: peer.fl_id.clone(),
                seed_share,
                key_share,
            };
            let bytes = bincode::serialize(&payload)?;
            encrypted.push(EncryptedShare {
                sender: self.fl_id.clone(),
                recipient: peer.fl_id.clone(),
                cipher: peer.c_pk.encrypt(&bytes),
            });
        }
        Ok(encrypted)
    }

    /// Decrypts and stores the shares the peers sent to this client.
    pub fn accept_shares(&mut self, shares: Vec<EncryptedShare>) -> Result<(), SecAggError> {
        let own_index = self.own_index()?;
        for share in shares {
            if share.recipient != self.fl_id {
                return Err(SecAggError::Misaddressed {
                    sender: share.sender,
                    recipient: share.recipient,
                });
            }
            if !self.peers.iter().any(|peer| peer.fl_id == share.sender) {
                return Err(SecAggError::UnknownPeer(share.sender));
            }
            let bytes = self.c_keys.secret.decrypt(&share.cipher, &self.c_keys.public)?;
            let payload: SharePayload = bincode::deserialize(&bytes)
                .map_err(|_| SecAggError::MalformedShare(share.sender.clone()))?;
            if payload.sender != share.sender
                || payload.recipient != self.fl_id
                || payload.seed_share.index != own_index
                || payload.key_share.index != own_index
            {
                return Err(SecAggError::Misaddressed {
                    sender: payload.sender,
                    recipient: payload.recipient,
                });
            }
            self.held.insert(
                payload.sender,
                HeldShares {
                    seed_share: payload.seed_share,
                    key_share: payload.key_share,
                },
            );
        }
        debug!("holding shares of {} clients", self.held.len());
        Ok(())
    }

    /// Computes the combined mask of this client.
    pub fn double_mask(&self) -> Result<FeatureMask, SecAggError> {
        if self.peers.is_empty() {
            return Err(SecAggError::PeersNotSet);
        }
        let len = self.config.feature_size;
        let mut mask = FeatureMask::from(self.seed.derive_mask(len));
        for peer in &self.peers {
            let sign = match PairSign::between(&self.fl_id, &peer.fl_id) {
                Some(sign) => sign,
                None => continue,
            };
            let secret = self.s_keys.secret.agree(&peer.s_pk)?;
            let pairwise = pairwise_seed(&secret, self.iteration).derive_mask(len);
            mask.accumulate(&pairwise, sign);
        }
        Ok(mask)
    }

    /// Selects the shares to reveal once the server announced the clients that uploaded.
    ///
    /// For each survivor the share of its individual seed is revealed, for every other peer
    /// the share of its agreement key. Revealing both for the same client would unmask it.
    pub fn reconstruction_shares(
        &self,
        survivors: &[FlId],
    ) -> Result<Vec<RevealedShare>, SecAggError> {
        if !survivors.contains(&self.fl_id) {
            return Err(SecAggError::NotASurvivor);
        }
        let mut revealed = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let held = match self.held.get(&peer.fl_id) {
                Some(held) => held,
                None => {
                    // the peer didn't send shares, so it can't have masked anything with ours
                    warn!("no share held for {}", peer.fl_id);
                    continue;
                }
            };
            let (kind, share) = if survivors.contains(&peer.fl_id) {
                (SecretKind::IndividualSeed, held.seed_share.clone())
            } else {
                (SecretKind::AgreementKey, held.key_share.clone())
            };
            revealed.push(RevealedShare {
                owner: peer.fl_id.clone(),
                kind,
                share,
            });
        }
        Ok(revealed)
    }

    fn own_index(&self) -> Result<u32, SecAggError> {
        if self.peers.is_empty() {
            return Err(SecAggError::PeersNotSet);
        }
        self.peers
            .iter()
            .position(|peer| peer.fl_id == self.fl_id)
            .map(|position| position as u32 + 1)
            .ok_or(SecAggError::MissingSelf)
    }
}

/// Recovers the individual mask of a survivor from the revealed shares of its seed.
pub fn recover_individual_mask(
    shares: &[Share],
    threshold: usize,
    prime: &PrimeModulus,
    len: usize,
) -> Result<Vec<f32>, SecAggError> {
    let seed = MaskSeed::from_integer(&shamir::combine(shares, threshold, prime)?)
        .ok_or(SecAggError::InvalidSecret)?;
    Ok(seed.derive_mask(len))
}

/// Recovers the sum of the pairwise masks the survivors added for a dropped client.
///
/// Subtracting the result from the aggregate removes every trace of the dropped client.
pub fn recover_pairwise_masks(
    dropped: &ClientKeys,
    key_shares: &[Share],
    survivors: &[ClientKeys],
    iteration: u64,
    threshold: usize,
    prime: &PrimeModulus,
    len: usize,
) -> Result<Vec<f32>, SecAggError> {
    let secret = secret_key_from_integer(&shamir::combine(key_shares, threshold, prime)?)
        .ok_or(SecAggError::InvalidSecret)?;
    if secret.public_key() != dropped.s_pk {
        return Err(SecAggError::InvalidSecret);
    }
    let mut residual = FeatureMask::zeroed(len);
    for survivor in survivors {
        let sign = match PairSign::between(&survivor.fl_id, &dropped.fl_id) {
            Some(sign) => sign,
            None => continue,
        };
        let shared = secret.agree(&survivor.s_pk)?;
        residual.accumulate(&pairwise_seed(&shared, iteration).derive_mask(len), sign);
    }
    Ok(residual.into())
}

fn secret_key_from_integer(int: &BigUint) -> Option<SecretEncryptKey> {
    let bytes = int.to_bytes_be();
    if bytes.len() > SecretEncryptKey::LENGTH {
        return None;
    }
    let mut array = vec![0_u8; SecretEncryptKey::LENGTH];
    array[SecretEncryptKey::LENGTH - bytes.len()..].copy_from_slice(&bytes);
    SecretEncryptKey::from_slice(&array)
}
