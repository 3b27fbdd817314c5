//! Remote cancel transport for the image service.

use crate::config::{ImageServiceConfig, MarkerScope};
use crate::error::{map_http_error, CoreError};
use crate::types::{GenerationKind, OwnerId};
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// File polled by the image service between diffusion steps; its presence
/// cancels every running generate job.
pub const GLOBAL_GENERATE_MARKER: &str = "cancel_all_generate.flag";

const MARKER_BODY: &str = "cancelled";

/// What a cancel marker should target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerTarget {
    pub owner: OwnerId,
    pub kind: GenerationKind,
    pub scope: MarkerScope,
}

/// Raw acknowledgement returned by the service.
#[derive(Debug, Clone, Default)]
pub struct CancelAck {
    pub body: serde_json::Value,
}

/// Cancellation channel towards the external job runner.
#[async_trait]
pub trait RemoteCancel: Send + Sync {
    /// Ask the service to cancel a job by its remote id. Idempotent.
    async fn cancel_job(&self, remote_id: &str) -> Result<CancelAck, CoreError>;

    /// Write the durable marker used when no remote id exists yet. Must not
    /// suspend: the registry calls it while committing the cancellation.
    fn write_cancel_marker(&self, target: &MarkerTarget) -> Result<PathBuf, CoreError>;
}

/// HTTP + flag-file transport for the image-generation microservice.
pub struct ImageServiceCancel {
    client: Client,
    base_url: String,
    flags_dir: PathBuf,
}

impl ImageServiceCancel {
    pub fn new(config: &ImageServiceConfig) -> Result<Self, CoreError> {
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.cancel_timeout_ms))
            .build()
            .map_err(|e| CoreError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            flags_dir: config.cancel_flags_dir.clone(),
        })
    }

    pub fn marker_path(&self, target: &MarkerTarget) -> PathBuf {
        marker_path(&self.flags_dir, target)
    }
}

/// Location of the marker file for `target` inside `flags_dir`.
pub fn marker_path(flags_dir: &std::path::Path, target: &MarkerTarget) -> PathBuf {
    match target.scope {
        MarkerScope::All => flags_dir.join(GLOBAL_GENERATE_MARKER),
        MarkerScope::Owner => flags_dir.join(format!("owner-{}.cancel", sanitize(&target.owner))),
    }
}

fn sanitize(owner: &str) -> String {
    owner
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl RemoteCancel for ImageServiceCancel {
    async fn cancel_job(&self, remote_id: &str) -> Result<CancelAck, CoreError> {
        let url = format!("{}/cancel/{}", self.base_url, remote_id);
        debug!(url = %url, "Sending remote cancel");
        let response = self.client.post(&url).send().await.map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CoreError::RemoteCancel(format!(
                "Cancel of {} failed with status {}: {}",
                remote_id, status, error_text
            )));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| CoreError::RemoteCancel(format!("Failed to parse cancel response: {}", e)))?;
        Ok(CancelAck { body })
    }

    fn write_cancel_marker(&self, target: &MarkerTarget) -> Result<PathBuf, CoreError> {
        std::fs::create_dir_all(&self.flags_dir)?;
        let path = self.marker_path(target);
        std::fs::write(&path, MARKER_BODY)?;
        Ok(path)
    }
}
