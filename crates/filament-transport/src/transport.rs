use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use tracing::debug;

use filament_types::BaseId;

use crate::endpoint::Endpoints;
use crate::error::{TransportError, TransportResult};

/// Streamed response body: raw byte chunks as the server produces them.
pub type ByteStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send>>;

/// Network seam for the download stage.
///
/// The production implementation is [`HttpTransport`]; tests substitute
/// in-memory implementations that replay canned wire bytes with arbitrary
/// chunking.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    /// Request a batch of objects; the body streams closure frames.
    async fn fetch_batch(&self, ids: &[BaseId]) -> TransportResult<ByteStream>;

    /// Fetch one object's raw JSON document (no frame envelope).
    async fn fetch_single(&self, id: &BaseId) -> TransportResult<String>;
}

/// Configuration for [`HttpTransport`].
#[derive(Clone, Debug, Default)]
pub struct HttpTransportOptions {
    pub base_url: String,
    pub stream_id: String,
    /// Bearer token, sent as `Authorization: Bearer <token>` when present.
    pub token: Option<String>,
    /// Caller-supplied request timeout. No timeout is imposed when absent;
    /// timeouts surface as batch-fatal transport errors, never retries.
    pub timeout: Option<Duration>,
}

/// HTTP implementation of [`ObjectTransport`] over a shared client.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl HttpTransport {
    pub fn new(options: HttpTransportOptions) -> TransportResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));
        if let Some(token) = &options.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Encode(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            endpoints: Endpoints::new(options.base_url, options.stream_id),
        })
    }

    fn check_status(status: reqwest::StatusCode) -> TransportResult<()> {
        if status.is_success() {
            return Ok(());
        }
        let status = status.as_u16();
        if status == 401 || status == 403 {
            return Err(TransportError::AccessDenied { status });
        }
        Err(TransportError::Failed { status })
    }
}

#[async_trait]
impl ObjectTransport for HttpTransport {
    async fn fetch_batch(&self, ids: &[BaseId]) -> TransportResult<ByteStream> {
        // The endpoint takes the id array double-encoded: a JSON string
        // holding a JSON array.
        let id_array = serde_json::to_string(&ids.iter().map(BaseId::as_str).collect::<Vec<_>>())
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        debug!(count = ids.len(), "requesting object batch");
        let response = self
            .client
            .post(self.endpoints.batch_url())
            .json(&serde_json::json!({ "objects": id_array }))
            .send()
            .await?;
        Self::check_status(response.status())?;

        Ok(Box::pin(response.bytes_stream().map_err(TransportError::from)))
    }

    async fn fetch_single(&self, id: &BaseId) -> TransportResult<String> {
        debug!(id = %id.short(), "requesting single object");
        let response = self
            .client
            .get(self.endpoints.single_url(id))
            .send()
            .await?;
        Self::check_status(response.status())?;
        Ok(response.text().await?)
    }
}
