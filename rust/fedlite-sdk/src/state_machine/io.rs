use std::error::Error;

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
    FlClient,
    Notify,
    Trainer,
};

pub(crate) type BoxError = Box<dyn Error + Send + Sync>;

/// Returns a dynamically dispatched [`IO`] object
pub(crate) fn boxed_io<C, T, N>(client: C, trainer: T, notifier: N) -> Box<dyn IO>
where
    C: FlClient + Send + 'static,
    T: Trainer + Send + 'static,
    N: Notify + Send + 'static,
{
    Box::new(StateMachineIO::new(client, trainer, notifier))
}

/// A trait that gathers all the [`FlClient`], [`Trainer`] and [`Notify`]
/// methods.
///
/// This trait is intended not to be exposed. It keeps the state machine free
/// of generic parameters: the phases hold a `Box<dyn IO>` instead of three
/// type parameters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait IO: Send + 'static {
    async fn start_fl_job(&mut self, req: RequestFlJob) -> Result<Reply<ResponseFlJob>, BoxError>;
    async fn update_model(
        &mut self,
        req: RequestUpdateModel,
    ) -> Result<Reply<ResponseUpdateModel>, BoxError>;
    async fn get_model(&mut self, req: RequestGetModel)
        -> Result<Reply<ResponseGetModel>, BoxError>;
    async fn get_result(
        &mut self,
        req: RequestGetResult,
    ) -> Result<Reply<ResponseGetResult>, BoxError>;
    async fn exchange_keys(
        &mut self,
        req: RequestExchangeKeys,
    ) -> Result<Reply<ResponseExchangeKeys>, BoxError>;
    async fn get_keys(&mut self, req: RequestGetKeys) -> Result<Reply<ResponseGetKeys>, BoxError>;
    async fn share_secrets(
        &mut self,
        req: RequestShareSecrets,
    ) -> Result<Reply<ResponseShareSecrets>, BoxError>;
    async fn get_secrets(
        &mut self,
        req: RequestGetSecrets,
    ) -> Result<Reply<ResponseGetSecrets>, BoxError>;
    async fn get_client_list(
        &mut self,
        req: RequestGetClientList,
    ) -> Result<Reply<ResponseClientList>, BoxError>;
    async fn reconstruct_secrets(
        &mut self,
        req: RequestReconstructSecrets,
    ) -> Result<Reply<ResponseReconstructSecrets>, BoxError>;

    /// Train the local model and return its loss
    fn train(&mut self, epochs: u32, learning_rate: f32) -> Result<f32, BoxError>;
    fn evaluate(&mut self, target: ModelTarget) -> Result<f32, BoxError>;
    fn infer(&mut self) -> Result<Vec<i32>, BoxError>;
    fn features(&self, target: ModelTarget, names: &[String]) -> Result<FeatureMap, BoxError>;
    fn update_features(&mut self, target: ModelTarget, features: &FeatureMap)
        -> Result<(), BoxError>;
    fn backup(&mut self) -> Result<(), BoxError>;
    fn restore(&mut self) -> Result<(), BoxError>;

    /// Notify the device that it joined a round
    fn notify_new_round(&mut self, iteration: u64);
    /// Notify the device that local training starts
    fn notify_train(&mut self);
    /// Notify the device that the update is being uploaded
    fn notify_upload(&mut self);
    /// Notify the device that the round is done
    fn notify_done(&mut self, iteration: u64);
    /// Notify the device that the round failed
    fn notify_failed(&mut self);
}

/// Internal struct that implements the [`IO`] trait. It is not used as is in
/// the state machine. Instead, we box it and use it as a `dyn IO` object.
struct StateMachineIO<C, T, N> {
    client: C,
    trainer: T,
    notifier: N,
}

impl<C, T, N> StateMachineIO<C, T, N> {
    fn new(client: C, trainer: T, notifier: N) -> Self {
        Self {
            client,
            trainer,
            notifier,
        }
    }
}

fn boxed<E: Error + Send + Sync + 'static>(e: E) -> BoxError {
    Box::new(e)
}

#[async_trait]
impl<C, T, N> IO for StateMachineIO<C, T, N>
where
    C: FlClient + Send + 'static,
    T: Trainer + Send + 'static,
    N: Notify + Send + 'static,
{
    async fn start_fl_job(&mut self, req: RequestFlJob) -> Result<Reply<ResponseFlJob>, BoxError> {
        self.client.start_fl_job(req).await.map_err(boxed)
    }

    async fn update_model(
        &mut self,
        req: RequestUpdateModel,
    ) -> Result<Reply<ResponseUpdateModel>, BoxError> {
        self.client.update_model(req).await.map_err(boxed)
    }

    async fn get_model(
        &mut self,
        req: RequestGetModel,
    ) -> Result<Reply<ResponseGetModel>, BoxError> {
        self.client.get_model(req).await.map_err(boxed)
    }

    async fn get_result(
        &mut self,
        req: RequestGetResult,
    ) -> Result<Reply<ResponseGetResult>, BoxError> {
        self.client.get_result(req).await.map_err(boxed)
    }

    async fn exchange_keys(
        &mut self,
        req: RequestExchangeKeys,
    ) -> Result<Reply<ResponseExchangeKeys>, BoxError> {
        self.client.exchange_keys(req).await.map_err(boxed)
    }

    async fn get_keys(&mut self, req: RequestGetKeys) -> Result<Reply<ResponseGetKeys>, BoxError> {
        self.client.get_keys(req).await.map_err(boxed)
    }

    async fn share_secrets(
        &mut self,
        req: RequestShareSecrets,
    ) -> Result<Reply<ResponseShareSecrets>, BoxError> {
        self.client.share_secrets(req).await.map_err(boxed)
    }

    async fn get_secrets(
        &mut self,
        req: RequestGetSecrets,
    ) -> Result<Reply<ResponseGetSecrets>, BoxError> {
        self.client.get_secrets(req).await.map_err(boxed)
    }

    async fn get_client_list(
        &mut self,
        req: RequestGetClientList,
    ) -> Result<Reply<ResponseClientList>, BoxError> {
        self.client.get_client_list(req).await.map_err(boxed)
    }

    async fn reconstruct_secrets(
        &mut self,
        req: RequestReconstructSecrets,
    ) -> Result<Reply<ResponseReconstructSecrets>, BoxError> {
        self.client.reconstruct_secrets(req).await.map_err(boxed)
    }

    fn train(&mut self, epochs: u32, learning_rate: f32) -> Result<f32, BoxError> {
        self.trainer.train(epochs, learning_rate).map_err(boxed)
    }

    fn evaluate(&mut self, target: ModelTarget) -> Result<f32, BoxError> {
        self.trainer.evaluate(target).map_err(boxed)
    }

    fn infer(&mut self) -> Result<Vec<i32>, BoxError> {
        self.trainer.infer().map_err(boxed)
    }

    fn features(&self, target: ModelTarget, names: &[String]) -> Result<FeatureMap, BoxError> {
        self.trainer.features(target, names).map_err(boxed)
    }

    fn update_features(
        &mut self,
        target: ModelTarget,
        features: &FeatureMap,
    ) -> Result<(), BoxError> {
        self.trainer.update_features(target, features).map_err(boxed)
    }

    fn backup(&mut self) -> Result<(), BoxError> {
        self.trainer.backup().map_err(boxed)
    }

    fn restore(&mut self) -> Result<(), BoxError> {
        self.trainer.restore().map_err(boxed)
    }

    fn notify_new_round(&mut self, iteration: u64) {
        self.notifier.notify_new_round(iteration)
    }

    fn notify_train(&mut self) {
        self.notifier.notify_train()
    }

    fn notify_upload(&mut self) {
        self.notifier.notify_upload()
    }

    fn notify_done(&mut self, iteration: u64) {
        self.notifier.notify_done(iteration)
    }

    fn notify_failed(&mut self) {
        self.notifier.notify_failed()
    }
}
