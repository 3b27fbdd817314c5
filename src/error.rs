//! Error types for the netricsa job core.
//!
//! Cancellation and policy refusals are not errors: a cancelled stream is a
//! [`crate::stream::StreamOutcome::Cancelled`] and a refused reply is a
//! [`crate::stream::PersistDecision`].

use thiserror::Error;

/// Errors surfaced by queue jobs, stream sources, sinks and configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The chunk source or an HTTP call failed outright.
    #[error("Transport error: {0}")]
    Transport(String),

    /// One streamed chunk could not be parsed. Logged and skipped by the
    /// aggregator, never returned from a stream run.
    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Remote cancel failed: {0}")]
    RemoteCancel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job panicked: {0}")]
    JobPanicked(String),

    #[error("Job dropped before settling")]
    JobDropped,

    /// The owner already holds a place in the queue.
    #[error("Owner {0} already has a request in progress")]
    OwnerBusy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        map_http_error(err)
    }
}

/// Classify a reqwest failure into a transport error with a readable cause.
pub fn map_http_error(error: reqwest::Error) -> CoreError {
    if let Some(status) = error.status() {
        CoreError::Transport(format!("Request failed with status {}: {}", status, error))
    } else if error.is_timeout() {
        CoreError::Transport(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        CoreError::Transport(format!("Connection error: {}", error))
    } else if error.is_decode() || error.is_body() {
        CoreError::Transport(format!("Body error: {}", error))
    } else {
        CoreError::Transport(format!("HTTP error: {}", error))
    }
}

/// Whether a reqwest failure is worth retrying (connection refused, timeout).
pub fn is_retryable_http_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}
