use async_trait::async_trait;

use fedlite_core::FeatureMap;

use crate::{
    message::{
        Reply,
        RequestExchangeKeys,
        RequestFlJob,
        RequestGetClientList,
        RequestGetKeys,
        RequestGetModel,
        RequestGetResult,
        RequestGetSecrets,
        RequestReconstructSecrets,
        RequestShareSecrets,
        RequestUpdateModel,
        ResponseClientList,
        ResponseExchangeKeys,
        ResponseFlJob,
        ResponseGetKeys,
        ResponseGetModel,
        ResponseGetResult,
        ResponseGetSecrets,
        ResponseReconstructSecrets,
        ResponseShareSecrets,
        ResponseUpdateModel,
    },
    runtime::ModelTarget,
};

/// A trait used by the [`StateMachine`] to emit notifications upon
/// certain events.
///
/// [`StateMachine`]: crate::StateMachine
pub trait Notify {
    /// Emit a notification when the device joined a new round
    fn notify_new_round(&mut self, _iteration: u64) {}
    /// Emit a notification when local training starts
    fn notify_train(&mut self) {}
    /// Emit a notification when the update is uploaded
    fn notify_upload(&mut self) {}
    /// Emit a notification when the round is done
    fn notify_done(&mut self, _iteration: u64) {}
    /// Emit a notification when the round failed
    fn notify_failed(&mut self) {}
}

/// A trait used by the [`StateMachine`] to communicate with the
/// coordinator.
///
/// Every method answers with the decoded [`Reply`] of the coordinator. An
/// error means the request didn't get a decodable answer at all.
///
/// [`StateMachine`]: crate::StateMachine
#[async_trait]
pub trait FlClient {
    type Error: ::std::error::Error + Send + Sync + 'static;

    /// Ask to take part in the current round.
    async fn start_fl_job(
        &mut self,
        req: RequestFlJob,
    ) -> Result<Reply<ResponseFlJob>, Self::Error>;

    /// Upload the trained update.
    async fn update_model(
        &mut self,
        req: RequestUpdateModel,
    ) -> Result<Reply<ResponseUpdateModel>, Self::Error>;

    /// Download the aggregated model.
    async fn get_model(
        &mut self,
        req: RequestGetModel,
    ) -> Result<Reply<ResponseGetModel>, Self::Error>;

    /// Poll the aggregation of the round.
    async fn get_result(
        &mut self,
        req: RequestGetResult,
    ) -> Result<Reply<ResponseGetResult>, Self::Error>;

    async fn exchange_keys(
        &mut self,
        req: RequestExchangeKeys,
    ) -> Result<Reply<ResponseExchangeKeys>, Self::Error>;

    async fn get_keys(
        &mut self,
        req: RequestGetKeys,
    ) -> Result<Reply<ResponseGetKeys>, Self::Error>;

    async fn share_secrets(
        &mut self,
        req: RequestShareSecrets,
    ) -> Result<Reply<ResponseShareSecrets>, Self::Error>;

    async fn get_secrets(
        &mut self,
        req: RequestGetSecrets,
    ) -> Result<Reply<ResponseGetSecrets>, Self::Error>;

    async fn get_client_list(
        &mut self,
        req: RequestGetClientList,
    ) -> Result<Reply<ResponseClientList>, Self::Error>;

    async fn reconstruct_secrets(
        &mut self,
        req: RequestReconstructSecrets,
    ) -> Result<Reply<ResponseReconstructSecrets>, Self::Error>;
}

/// A trait used by the [`StateMachine`] to train, evaluate and update the
/// local model.
///
/// [`LocalModel`] implements it on top of a model runtime.
///
/// [`StateMachine`]: crate::StateMachine
/// [`LocalModel`]: crate::runtime::LocalModel
pub trait Trainer {
    type Error: ::std::error::Error + Send + Sync + 'static;

    /// Train the model for `epochs` epochs and return the final loss.
    fn train(&mut self, epochs: u32, learning_rate: f32) -> Result<f32, Self::Error>;

    /// Evaluate a model and return its accuracy.
    fn evaluate(&mut self, target: ModelTarget) -> Result<f32, Self::Error>;

    /// Run inference and return the predicted class of each sample.
    fn infer(&mut self) -> Result<Vec<i32>, Self::Error>;

    /// Snapshot the named features of a model, all of them if `names` is
    /// empty.
    fn features(&self, target: ModelTarget, names: &[String]) -> Result<FeatureMap, Self::Error>;

    /// Overwrite features of a model.
    fn update_features(
        &mut self,
        target: ModelTarget,
        features: &FeatureMap,
    ) -> Result<(), Self::Error>;

    /// Save the weights of the train model so that they can be restored.
    fn backup(&mut self) -> Result<(), Self::Error>;

    /// Restore the weights saved by the last backup.
    fn restore(&mut self) -> Result<(), Self::Error>;
}
