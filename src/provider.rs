//! Chat Source
//!
//! Where streamed replies come from. The job core only needs "open a stream
//! of raw chunks for these messages"; [`OllamaClient`] provides it over the
//! local Ollama `/api/chat` endpoint.

use crate::config::{OllamaConfig, RetryConfig};
use crate::error::{is_retryable_http_error, map_http_error, CoreError};
use crate::stream::ChunkSource;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling options sent with every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub num_predict: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self::from(&OllamaConfig::default())
    }
}

impl From<&OllamaConfig> for ChatOptions {
    fn from(config: &OllamaConfig) -> Self {
        Self {
            temperature: config.temperature,
            repeat_penalty: config.repeat_penalty,
            num_predict: config.num_predict,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Overrides the client's configured options
    pub options: Option<ChatOptions>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            options: None,
        }
    }
}

/// Source of streamed chat replies
#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Start generating and return the raw reply stream.
    async fn open_stream(&self, request: ChatRequest) -> Result<ChunkSource, CoreError>;

    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: &'a ChatOptions,
}

fn build_http_client(config: &OllamaConfig) -> Result<Client, CoreError> {
    Client::builder()
        .no_proxy()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .build()
        .map_err(|e| CoreError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Ollama chat client
pub struct OllamaClient {
    client: Client,
    response_timeout: Duration,
    model: String,
    base_url: String,
    options: ChatOptions,
    retry: RetryConfig,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig, retry: &RetryConfig) -> Result<Self, CoreError> {
        Ok(Self {
            client: build_http_client(config)?,
            response_timeout: Duration::from_millis(config.request_timeout_ms),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            options: ChatOptions::from(config),
            retry: retry.clone(),
        })
    }

    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl ChatSource for OllamaClient {
    async fn open_stream(&self, request: ChatRequest) -> Result<ChunkSource, CoreError> {
        let options = request.options.as_ref().unwrap_or(&self.options);
        let body = ChatBody {
            model: &self.model,
            messages: &request.messages,
            stream: true,
            options,
        };
        let url = self.chat_url();
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 1;
        let response = loop {
            let request = self.client.post(&url).json(&body).send();
            let failure = match tokio::time::timeout(self.response_timeout, request).await {
                Ok(Ok(response)) => break response,
                Ok(Err(err)) if is_retryable_http_error(&err) => map_http_error(err),
                Ok(Err(err)) => return Err(map_http_error(err)),
                Err(_) => CoreError::Transport(format!(
                    "Request timeout: no response within {} ms",
                    self.response_timeout.as_millis()
                )),
            };
            if attempt >= max_attempts {
                return Err(failure);
            }
            let backoff = Duration::from_millis(self.retry.backoff_ms * u64::from(attempt));
            warn!(
                url = %url,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis(),
                error = %failure,
                "Chat request failed; retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        };

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CoreError::Transport(format!(
                "Chat request failed with status {}: {}",
                status, error_text
            )));
        }

        debug!(
            model = %self.model,
            messages = request.messages.len(),
            attempt,
            "Chat stream opened"
        );
        Ok(response.bytes_stream().map_err(map_http_error).boxed())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
