use serde::{Deserialize, Serialize};

use fedlite_core::{
    compress::CompressedUpdate,
    crypto::{PublicSigningKey, Signature},
    FeatureMap,
    FlId,
    ResponseCode,
};

use super::FlPlan;

/// Signature over `fl_id ‖ timestamp ‖ iteration`, proving the identity of a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProof {
    pub public_key: PublicSigningKey,
    pub signature: Signature,
}

/// Request sent to `/startFLJob` to join a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFlJob {
    pub fl_name: String,
    pub fl_id: FlId,
    pub iteration: u64,
    /// Number of samples of the local training set.
    pub data_size: u32,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    pub identity_proof: Option<IdentityProof>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseFlJob {
    pub retcode: ResponseCode,
    pub reason: String,
    pub iteration: u64,
    pub is_selected: bool,
    pub next_req_time: u64,
    pub fl_plan_config: Option<FlPlan>,
    /// The global weights the round starts from.
    pub feature_map: FeatureMap,
    /// Names of the features the privacy transforms apply to, all features if empty.
    pub update_feature_names: Vec<String>,
    pub upload_compress_type: String,
    pub upload_sparse_rate: f32,
    pub unsupervised_eval_flg: bool,
    pub timestamp: u64,
}

impl_server_response!(ResponseFlJob);

/// What a client uploads, depending on the privacy mode and compression of the round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UploadPayload {
    /// Weights scaled by the training set size, possibly masked or noised.
    Dense(FeatureMap),
    /// Sparse quantized diff of the weights.
    Compressed(CompressedUpdate),
    /// SignDS selection of the update.
    SignDs {
        sign: bool,
        b_hat: bool,
        indices: Vec<u64>,
    },
}

/// Request sent to `/updateModel` to upload the trained update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestUpdateModel {
    pub fl_name: String,
    pub fl_id: FlId,
    pub iteration: u64,
    pub timestamp: u64,
    pub payload: UploadPayload,
    /// Noisy histogram of the inferred classes, when unsupervised evaluation is enabled.
    pub unsupervised_eval_items: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseUpdateModel {
    pub retcode: ResponseCode,
    pub reason: String,
    pub next_req_time: u64,
    pub timestamp: u64,
}

impl_server_response!(ResponseUpdateModel);

/// Request sent to `/getModel` to download the aggregated weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGetModel {
    pub fl_name: String,
    pub iteration: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseGetModel {
    pub retcode: ResponseCode,
    pub reason: String,
    pub iteration: u64,
    pub feature_map: FeatureMap,
    /// Earliest retry time on a restart.
    pub timestamp: u64,
}

impl_server_response!(ResponseGetModel, timestamp);

/// Request sent to `/getResult` to poll the aggregation of the round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGetResult {
    pub fl_name: String,
    pub iteration: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseGetResult {
    pub retcode: ResponseCode,
    pub reason: String,
    pub iteration: u64,
    pub timestamp: u64,
}

impl_server_response!(ResponseGetResult, timestamp);
