use crate::config::Config;
use crate::reading::Batch;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream rejected batch with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Sends a batch to the ingestion service. Retrying the same batch must be
/// safe; delivery is at-least-once.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, batch: &Batch) -> Result<(), UploadError>;
}

/// Runs one upload attempt with a hard deadline. An elapsed deadline counts
/// as a failed upload.
pub async fn upload_with_timeout(
    uploader: &dyn Uploader,
    batch: &Batch,
    limit: Duration,
) -> Result<(), UploadError> {
    match tokio::time::timeout(limit, uploader.upload(batch)).await {
        Ok(res) => res,
        Err(_) => Err(UploadError::Timeout(limit)),
    }
}

/// POSTs batches as JSON to the upstream ingest endpoint.
pub struct HttpUploader {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpUploader {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nanoclaw/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, batch: &Batch) -> Result<(), UploadError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Idempotency-Key", batch.dedupe_key())
            .json(batch)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    UploadError::Timeout(self.timeout)
                } else {
                    UploadError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }
        Ok(())
    }
}

const MAX_ERROR_BODY_BYTES: usize = 256;

fn truncate_body(mut body: String) -> String {
    if body.len() <= MAX_ERROR_BODY_BYTES {
        return body;
    }
    let mut end = MAX_ERROR_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body.truncate(end);
    body.push_str("...");
    body
}

/// Stand-in used when no upstream is configured: waits a little, then
/// reports success.
pub struct SimulatedUploader {
    delay: Duration,
}

impl SimulatedUploader {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Uploader for SimulatedUploader {
    async fn upload(&self, batch: &Batch) -> Result<(), UploadError> {
        tokio::time::sleep(self.delay).await;
        tracing::debug!(
            gateway_id = %batch.gateway_id,
            size = batch.len(),
            "simulated upstream upload"
        );
        Ok(())
    }
}

pub fn from_config(config: &Config) -> Result<Arc<dyn Uploader>> {
    match &config.upstream_url {
        Some(url) => {
            tracing::info!(upstream=%url, "uploading batches to upstream ingest service");
            Ok(Arc::new(HttpUploader::new(url.clone(), config.upload_timeout)?))
        }
        None => {
            tracing::warn!("NANOCLAW_UPSTREAM_URL not set; batch uploads are simulated");
            Ok(Arc::new(SimulatedUploader::new(
                config.simulated_upload_delay,
            )))
        }
    }
}
