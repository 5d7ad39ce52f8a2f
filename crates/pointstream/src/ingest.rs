//! Ingestion client: one GET per cycle, then decode.

use crate::data::{decode_payload, Batch};
use crate::error::{IngestError, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Abstraction over the HTTP GET used to reach the sensor service.
///
/// # Implementations
///
/// - **Production**: [`HttpTransport`], backed by `reqwest`
/// - **Tests**: scripted in-memory responses
///
/// Dropping the returned future must abort the request; the scheduler relies
/// on that for cancellation at shutdown.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fetches the full response body from `url`.
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        (**self).get(url).await
    }
}

/// Fetches and decodes point-cloud payloads from one endpoint.
///
/// The client never retries; retry policy belongs to the scheduler.
pub struct IngestClient<T> {
    transport: T,
    url: String,
    timeout: Duration,
}

impl<T: Transport> IngestClient<T> {
    pub fn new(transport: T, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One request bounded by the configured timeout. Returns the raw body.
    pub async fn fetch_payload(&self) -> Result<Vec<u8>, IngestError> {
        match tokio::time::timeout(self.timeout, self.transport.get(&self.url)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(IngestError::Timeout(self.timeout)),
        }
    }

    /// Fetch followed by decode.
    pub async fn fetch(&self) -> Result<Batch, IngestError> {
        let body = self.fetch_payload().await?;
        decode_payload(&body)
    }
}
