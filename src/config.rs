//! Configuration System
//!
//! Layered runtime configuration: serde defaults, then the global user file,
//! then workspace files, then `NETRICSA__*` environment variables. All
//! durations are milliseconds.

use crate::error::CoreError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod loader;
mod sources;

pub use loader::ConfigLoader;
pub use sources::{global_config_path, workspace_config_paths};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub persona: PersonaConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub image_service: ImageServiceConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub notices: NoticeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Persona the model speaks as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_persona_name")]
    pub name: String,

    /// Inline system prompt; wins over `system_prompt_path`
    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,
}

fn default_persona_name() -> String {
    "Netricsa".to_string()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: default_persona_name(),
            system_prompt: None,
            system_prompt_path: None,
        }
    }
}

impl PersonaConfig {
    /// Resolve the system prompt text.
    pub fn resolve_system_prompt(&self) -> Result<String, CoreError> {
        if let Some(prompt) = &self.system_prompt {
            return Ok(prompt.clone());
        }
        match &self.system_prompt_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                CoreError::Config(format!("Failed to read system prompt {:?}: {}", path, e))
            }),
            None => Ok(format!("Tu es {}, une assistante Discord.", self.name)),
        }
    }
}

/// Streaming and paging of replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Sink update cadence, independent of chunk arrival
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Delay before the final flush, letting the last edit land
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Hard per-unit character limit of the destination
    #[serde(default = "default_max_segment_chars")]
    pub max_segment_chars: usize,

    /// The first unit is not created before this many characters exist
    #[serde(default = "default_min_first_unit_chars")]
    pub min_first_unit_chars: usize,

    /// Frame interval of progress indicators
    #[serde(default = "default_indicator_interval_ms")]
    pub indicator_interval_ms: u64,

    /// A stream that stays silent this long fails as a transport error
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_max_segment_chars() -> usize {
    1900
}

fn default_min_first_unit_chars() -> usize {
    20
}

fn default_indicator_interval_ms() -> u64 {
    1500
}

fn default_idle_timeout_ms() -> u64 {
    120_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            max_segment_chars: default_max_segment_chars(),
            min_first_unit_chars: default_min_first_unit_chars(),
            indicator_interval_ms: default_indicator_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Local model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_ollama_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default = "default_num_predict")]
    pub num_predict: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Time allowed until the response headers arrive; the streamed body is
    /// bounded by `stream.idle_timeout_ms` instead
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    1.0
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_num_predict() -> u32 {
    600
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    300_000
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model: default_ollama_model(),
            temperature: default_temperature(),
            repeat_penalty: default_repeat_penalty(),
            num_predict: default_num_predict(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Scope of the durable cancel marker written when no remote id is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerScope {
    /// The image service's global generate marker; stops every generate job
    /// that is still running
    All,
    /// A per-owner marker, for services that poll one
    Owner,
}

/// Image-generation microservice (cancellation side only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageServiceConfig {
    #[serde(default = "default_image_url")]
    pub base_url: String,

    #[serde(default = "default_cancel_flags_dir")]
    pub cancel_flags_dir: PathBuf,

    #[serde(default = "default_marker_scope")]
    pub marker_scope: MarkerScope,

    #[serde(default = "default_image_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
}

fn default_image_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_cancel_flags_dir() -> PathBuf {
    PathBuf::from("python_services").join("cancel_flags")
}

fn default_marker_scope() -> MarkerScope {
    MarkerScope::All
}

fn default_image_connect_timeout_ms() -> u64 {
    5_000
}

fn default_cancel_timeout_ms() -> u64 {
    10_000
}

impl Default for ImageServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_image_url(),
            cancel_flags_dir: default_cancel_flags_dir(),
            marker_scope: default_marker_scope(),
            connect_timeout_ms: default_image_connect_timeout_ms(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
        }
    }
}

/// Retry of transient connection failures when opening a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff unit: attempt n waits n * backoff_ms
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Which final replies qualify for conversation memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,

    /// Case-insensitive substrings marking a refusal
    #[serde(default = "default_refusal_patterns")]
    pub refusal_patterns: Vec<String>,

    /// Regexes matched against the whole trimmed reply
    #[serde(default = "default_noise_patterns")]
    pub noise_patterns: Vec<String>,
}

fn default_min_chars() -> usize {
    5
}

fn default_refusal_patterns() -> Vec<String> {
    ["je ne peux pas", "i cannot", "i can't"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_noise_patterns() -> Vec<String> {
    [
        r"(?i)^(lol|mdr|xd|ptdr|mdrr|mdrrr)$",
        r"^[!?.,;:]+$",
        r"(?i)^(ah+|oh+|eh+|hm+|um+|uh+)$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            refusal_patterns: default_refusal_patterns(),
            noise_patterns: default_noise_patterns(),
        }
    }
}

/// Terminal messages substituted into the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeConfig {
    #[serde(default = "default_failed_notice")]
    pub failed: String,

    /// `None` leaves the partial reply as the last word
    #[serde(default = "default_cancelled_notice")]
    pub cancelled: Option<String>,
}

fn default_failed_notice() -> String {
    "An error occurred while processing your message.".to_string()
}

fn default_cancelled_notice() -> Option<String> {
    Some("🛑 Réponse annulée.".to_string())
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self {
            failed: default_failed_notice(),
            cancelled: default_cancelled_notice(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Stream(String),
    Endpoint(String, String),
    Retry(String),
    Policy(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Stream(msg) => write!(f, "Stream: {}", msg),
            ValidationError::Endpoint(name, msg) => write!(f, "Endpoint '{}': {}", name, msg),
            ValidationError::Retry(msg) => write!(f, "Retry: {}", msg),
            ValidationError::Policy(msg) => write!(f, "Policy: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl BotConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.stream.max_segment_chars == 0 {
            errors.push(ValidationError::Stream(
                "max_segment_chars must be greater than zero".to_string(),
            ));
        }
        if self.stream.min_first_unit_chars > self.stream.max_segment_chars {
            errors.push(ValidationError::Stream(format!(
                "min_first_unit_chars ({}) exceeds max_segment_chars ({})",
                self.stream.min_first_unit_chars, self.stream.max_segment_chars
            )));
        }
        if self.stream.idle_timeout_ms == 0 {
            errors.push(ValidationError::Stream(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.stream.flush_interval_ms == 0 {
            errors.push(ValidationError::Stream(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }

        for (name, url) in [
            ("ollama", &self.ollama.base_url),
            ("image_service", &self.image_service.base_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ValidationError::Endpoint(
                    name.to_string(),
                    format!("base_url must be an http(s) URL, got '{}'", url),
                ));
            }
        }
        if self.ollama.model.trim().is_empty() {
            errors.push(ValidationError::Endpoint(
                "ollama".to_string(),
                "model cannot be empty".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            errors.push(ValidationError::Retry(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        for pattern in &self.policy.noise_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(ValidationError::Policy(format!(
                    "Invalid noise pattern '{}': {}",
                    pattern, e
                )));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
