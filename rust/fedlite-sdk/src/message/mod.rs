//! Logical messages exchanged with the coordinator.
//!
//! Every endpoint takes one request and answers with one response. Both are `serde` structs
//! encoded with [`bincode`]. Before a response body is decoded, it is checked against the plain
//! text signals the coordinator sends when it can't process requests at all, see [`Reply`].

// the macro must be defined before the modules that use it
macro_rules! impl_server_response {
    ($response:ty) => {
        impl_server_response!($response, next_req_time);
    };
    ($response:ty, $retry_field:ident) => {
        impl $crate::message::ServerResponse for $response {
            fn retcode(&self) -> fedlite_core::ResponseCode {
                self.retcode
            }

            fn reason(&self) -> &str {
                &self.reason
            }

            fn next_req_time(&self) -> u64 {
                self.$retry_field
            }
        }
    };
}

mod fl_job;
mod plan;
mod secagg;

pub use self::{
    fl_job::{
        IdentityProof,
        RequestFlJob,
        RequestGetModel,
        RequestGetResult,
        RequestUpdateModel,
        ResponseFlJob,
        ResponseGetModel,
        ResponseGetResult,
        ResponseUpdateModel,
        UploadPayload,
    },
    plan::{
        DpParams,
        FlPlan,
        Plan,
        PrivacyParams,
        PwParams,
        WireDpParams,
        WirePwParams,
        WireSignDsParams,
    },
    secagg::{
        RequestExchangeKeys,
        RequestGetClientList,
        RequestGetKeys,
        RequestGetSecrets,
        RequestReconstructSecrets,
        RequestShareSecrets,
        ResponseClientList,
        ResponseExchangeKeys,
        ResponseGetKeys,
        ResponseGetSecrets,
        ResponseReconstructSecrets,
        ResponseShareSecrets,
    },
};

use serde::{de::DeserializeOwned, Serialize};

use fedlite_core::ResponseCode;

/// Body sent instead of a response while the coordinator is in safe mode.
pub const NOT_READY_SIGNAL: &str = "The cluster is in safemode.";
/// Body sent instead of a response once the training job is over.
pub const JOB_NOT_AVAILABLE_SIGNAL: &str = "The server's training job is disabled or finished.";

/// A decoded coordinator reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    /// A regular response message.
    Message(T),
    /// The coordinator can't serve requests yet.
    NotReady,
    /// The training job is disabled or finished. The whole task must stop.
    JobNotAvailable,
}

/// Decodes a response body, recognizing the coordinator signals first.
pub fn decode_reply<T>(body: &[u8]) -> Result<Reply<T>, bincode::Error>
where
    T: DeserializeOwned,
{
    if body == NOT_READY_SIGNAL.as_bytes() {
        return Ok(Reply::NotReady);
    }
    if body == JOB_NOT_AVAILABLE_SIGNAL.as_bytes() {
        return Ok(Reply::JobNotAvailable);
    }
    Ok(Reply::Message(bincode::deserialize(body)?))
}

/// The fields every response carries.
pub trait ServerResponse {
    fn retcode(&self) -> ResponseCode;

    fn reason(&self) -> &str;

    /// Earliest time, in milliseconds since the epoch, at which the client may retry after a
    /// restart.
    fn next_req_time(&self) -> u64;
}

/// Encodes a message the way the coordinator expects it.
pub fn encode<T>(message: &T) -> Result<Vec<u8>, bincode::Error>
where
    T: Serialize,
{
    bincode::serialize(message)
}
