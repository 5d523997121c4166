use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

use crate::{
    message::{
        decode_reply,
        encode,
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
    FlClient,
};

/// Error returned by a [`Client`] request
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to deserialize data: {0}")]
    Deserialize(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Unexpected response")]
    UnexpectedResponse(u16),
}

impl ClientError {
    #[cfg(feature = "reqwest-client")]
    fn http_error<E: std::error::Error>(e: E) -> Self {
        Self::Http(format!("{}", e))
    }
}

/// A basic HTTP interface that [`Client`] HTTP backends must implement.
#[async_trait]
pub trait FlHttpClient {
    /// Perform an HTTP `POST` on the given URL, with the given body, and
    /// return the body of the response.
    async fn post(&mut self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, ClientError>;
}

#[derive(Debug, Clone)]
/// A client that communicates with the coordinator's API via HTTP(S).
pub struct Client<C> {
    /// HTTP(S) client
    client: C,
    /// Coordinator URL
    base_url: Url,
}

/// Error returned when trying to create a [`Client`] with an invalid
/// address for the coordinator.
#[derive(Debug, Error)]
#[error("Invalid base URL: {}", .0)]
pub struct InvalidBaseUrl(String);

impl<C> Client<C>
where
    C: FlHttpClient,
{
    /// Create a new client.
    ///
    /// # Args
    ///
    /// - `client` is the HTTP client that will be used to perform the HTTP requests. Any HTTP
    ///   client can be used, as long as it implements the [`FlHttpClient`] trait.
    /// - `base_url` is the URL to the coordinator
    ///
    /// # Errors
    ///
    /// An error is returned if `base_url` is not a valid URL
    pub fn new(http_client: C, base_url: &str) -> Result<Self, InvalidBaseUrl> {
        let base_url = Url::parse(base_url).map_err(|e| InvalidBaseUrl(format!("{}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(InvalidBaseUrl(String::from("cannot be a base URL")));
        }
        Ok(Self {
            client: http_client,
            base_url,
        })
    }

    /// Append the given segment to the client base URL
    fn url(&self, segment: &str) -> Url {
        let mut url = self.base_url.clone();
        // UNWRAP_SAFE: the base URL was checked in `new()`
        url.path_segments_mut().unwrap().pop_if_empty().push(segment);
        url
    }

    async fn request<Req, Resp>(
        &mut self,
        segment: &str,
        req: Req,
    ) -> Result<Reply<Resp>, ClientError>
    where
        Req: Serialize + Send,
        Resp: DeserializeOwned,
    {
        let url = self.url(segment);
        let body = encode(&req).map_err(|e| ClientError::Encode(format!("{}", e)))?;
        debug!("POST {} ({} bytes)", url, body.len());
        let resp = self.client.post(url.as_str(), body).await?;
        decode_reply(&resp).map_err(|e| ClientError::Deserialize(format!("{}", e)))
    }
}

impl<C> Client<C>
where
    C: FlHttpClient + Clone + Send + 'static,
{
    /// Upload an update in the background.
    ///
    /// The reply is delivered on the returned channel. Dropping the
    /// receiver abandons the upload.
    pub fn update_model_detached(
        &self,
        req: RequestUpdateModel,
    ) -> oneshot::Receiver<Result<Reply<ResponseUpdateModel>, ClientError>> {
        let (mut tx, rx) = oneshot::channel();
        let mut client = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("upload abandoned by the receiver");
                }
                reply = client.update_model(req) => {
                    // the receiver may be dropped at the same time
                    let _ = tx.send(reply);
                }
            }
        });
        rx
    }
}

#[async_trait]
impl<C> FlClient for Client<C>
where
    C: FlHttpClient + Send,
{
    type Error = ClientError;

    async fn start_fl_job(
        &mut self,
        req: RequestFlJob,
    ) -> Result<Reply<ResponseFlJob>, Self::Error> {
        self.request("startFLJob", req).await
    }

    async fn update_model(
        &mut self,
        req: RequestUpdateModel,
    ) -> Result<Reply<ResponseUpdateModel>, Self::Error> {
        self.request("updateModel", req).await
    }

    async fn get_model(
        &mut self,
        req: RequestGetModel,
    ) -> Result<Reply<ResponseGetModel>, Self::Error> {
        self.request("getModel", req).await
    }

    async fn get_result(
        &mut self,
        req: RequestGetResult,
    ) -> Result<Reply<ResponseGetResult>, Self::Error> {
        self.request("getResult", req).await
    }

    async fn exchange_keys(
        &mut self,
        req: RequestExchangeKeys,
    ) -> Result<Reply<ResponseExchangeKeys>, Self::Error> {
        self.request("exchangeKeys", req).await
    }

    async fn get_keys(
        &mut self,
        req: RequestGetKeys,
    ) -> Result<Reply<ResponseGetKeys>, Self::Error> {
        self.request("getKeys", req).await
    }

    async fn share_secrets(
        &mut self,
        req: RequestShareSecrets,
    ) -> Result<Reply<ResponseShareSecrets>, Self::Error> {
        self.request("shareSecrets", req).await
    }

    async fn get_secrets(
        &mut self,
        req: RequestGetSecrets,
    ) -> Result<Reply<ResponseGetSecrets>, Self::Error> {
        self.request("getSecrets", req).await
    }

    async fn get_client_list(
        &mut self,
        req: RequestGetClientList,
    ) -> Result<Reply<ResponseClientList>, Self::Error> {
        self.request("getClientList", req).await
    }

    async fn reconstruct_secrets(
        &mut self,
        req: RequestReconstructSecrets,
    ) -> Result<Reply<ResponseReconstructSecrets>, Self::Error> {
        self.request("reconstructSecrets", req).await
    }
}

#[cfg(feature = "reqwest-client")]
#[async_trait]
impl FlHttpClient for reqwest::Client {
    async fn post(&mut self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let resp = reqwest::Client::post(self, url)
            .body(body)
            .send()
            .await
            .map_err(ClientError::http_error)?
            .error_for_status()
            .map_err(ClientError::http_error)?;
        match resp.status() {
            reqwest::StatusCode::OK => Ok(resp
                .bytes()
                .await
                .map_err(ClientError::http_error)?
                .to_vec()),
            status => Err(ClientError::UnexpectedResponse(status.as_u16())),
        }
    }
}

/// Build a `reqwest` client with the timeouts of the API settings.
#[cfg(feature = "reqwest-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest-client")))]
pub fn http_client(
    settings: &crate::settings::ApiSettings,
) -> Result<reqwest::Client, ClientError> {
    reqwest::ClientBuilder::new()
        .connect_timeout(settings.connect_timeout())
        .timeout(settings.read_timeout())
        .build()
        .map_err(ClientError::http_error)
}
