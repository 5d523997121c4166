//! Exchanges of the pairwise masking protocol. The coordinator only relays them.

use serde::{Deserialize, Serialize};

use fedlite_core::{
    secagg::{ClientKeys, EncryptedShare, RevealedShare},
    FlId,
    ResponseCode,
};

/// Publishes the keys of a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestExchangeKeys {
    pub fl_id: FlId,
    pub iteration: u64,
    pub keys: ClientKeys,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseExchangeKeys {
    pub retcode: ResponseCode,
    pub reason: String,
    pub next_req_time: u64,
}

impl_server_response!(ResponseExchangeKeys);

/// Fetches the keys published by all the clients of the iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGetKeys {
    pub fl_id: FlId,
    pub iteration: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseGetKeys {
    pub retcode: ResponseCode,
    pub reason: String,
    pub iteration: u64,
    pub keys: Vec<ClientKeys>,
    pub next_req_time: u64,
}

impl_server_response!(ResponseGetKeys);

/// Sends the encrypted shares of a client's secrets to its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestShareSecrets {
    pub fl_id: FlId,
    pub iteration: u64,
    pub shares: Vec<EncryptedShare>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseShareSecrets {
    pub retcode: ResponseCode,
    pub reason: String,
    pub next_req_time: u64,
}

impl_server_response!(ResponseShareSecrets);

/// Fetches the shares addressed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGetSecrets {
    pub fl_id: FlId,
    pub iteration: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseGetSecrets {
    pub retcode: ResponseCode,
    pub reason: String,
    pub iteration: u64,
    pub shares: Vec<EncryptedShare>,
    pub next_req_time: u64,
}

impl_server_response!(ResponseGetSecrets);

/// Fetches the clients whose update reached the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGetClientList {
    pub fl_id: FlId,
    pub iteration: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseClientList {
    pub retcode: ResponseCode,
    pub reason: String,
    pub iteration: u64,
    pub clients: Vec<FlId>,
    pub next_req_time: u64,
}

impl_server_response!(ResponseClientList);

/// Reveals the shares needed to remove the masks from the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestReconstructSecrets {
    pub fl_id: FlId,
    pub iteration: u64,
    pub shares: Vec<RevealedShare>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseReconstructSecrets {
    pub retcode: ResponseCode,
    pub reason: String,
    pub iteration: u64,
    pub next_req_time: u64,
}

impl_server_response!(ResponseReconstructSecrets);
