//! Storage API adapter: blob download and model/prediction upload.

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;
use uuid::Uuid;

use weft_types::{AlgoRecord, ModelRecord, PredictionRecord};

use crate::ClientError;

/// A read-once blob body.  The consumer closes it by dropping it.
pub type BlobStream = Box<dyn AsyncRead + Send + Unpin>;

/// Kinds of blob the storage service holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BlobKind {
    Algo,
    ProblemWorkflow,
    Data,
    Model,
}

/// Fetch and upload platform artifacts.
///
/// Uploads take an explicit `size` that is sent as the Content-Length;
/// indefinite streams are rejected by construction.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stream the raw blob for `uuid`.
    async fn get_blob(&self, kind: BlobKind, uuid: Uuid) -> Result<BlobStream, ClientError>;

    /// Fetch algorithm metadata.
    async fn get_algo(&self, uuid: Uuid) -> Result<AlgoRecord, ClientError>;

    /// Fetch model metadata (resolves the algo a model was trained with).
    async fn get_model(&self, uuid: Uuid) -> Result<ModelRecord, ClientError>;

    /// Upload a freshly trained model of exactly `size` bytes.
    async fn post_model(
        &self,
        model: &ModelRecord,
        body: BlobStream,
        size: u64,
    ) -> Result<(), ClientError>;

    /// Upload a prediction blob of exactly `size` bytes.
    async fn post_prediction(
        &self,
        prediction: &PredictionRecord,
        body: BlobStream,
        size: u64,
    ) -> Result<(), ClientError>;
}

/// reqwest-backed [`Storage`] client with basic authentication.
#[derive(Debug, Clone)]
pub struct StorageHttp {
    client: reqwest::Client,
    base: String,
    user: String,
    password: String,
}

const SERVICE: &str = "storage";

impl StorageHttp {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://{host}:{port}"),
            user: user.to_owned(),
            password: password.to_owned(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base, path))
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self
            .get(path)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(SERVICE, e))?;
        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(SERVICE, status, reason));
        }
        response.json().await.map_err(|e| ClientError::Decode {
            service: SERVICE,
            reason: e.to_string(),
        })
    }

    async fn post_blob(
        &self,
        path: &str,
        body: BlobStream,
        size: u64,
    ) -> Result<(), ClientError> {
        let stream = ReaderStream::new(body);
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(SERVICE, status, reason));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for StorageHttp {
    async fn get_blob(&self, kind: BlobKind, uuid: Uuid) -> Result<BlobStream, ClientError> {
        let response = self
            .get(&format!("/{kind}/{uuid}/blob"))
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(SERVICE, e))?;
        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(SERVICE, status, reason));
        }

        debug!(%kind, %uuid, "streaming blob from storage");
        let stream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn get_algo(&self, uuid: Uuid) -> Result<AlgoRecord, ClientError> {
        self.get_json(&format!("/algo/{uuid}")).await
    }

    async fn get_model(&self, uuid: Uuid) -> Result<ModelRecord, ClientError> {
        self.get_json(&format!("/model/{uuid}")).await
    }

    async fn post_model(
        &self,
        model: &ModelRecord,
        body: BlobStream,
        size: u64,
    ) -> Result<(), ClientError> {
        debug!(uuid = %model.uuid, size, "posting model to storage");
        self.post_blob(&format!("/model/{}", model.uuid), body, size)
            .await
    }

    async fn post_prediction(
        &self,
        prediction: &PredictionRecord,
        body: BlobStream,
        size: u64,
    ) -> Result<(), ClientError> {
        debug!(uuid = %prediction.uuid, size, "posting prediction to storage");
        self.post_blob(&format!("/prediction/{}", prediction.uuid), body, size)
            .await
    }
}
