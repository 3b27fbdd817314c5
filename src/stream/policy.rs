//! Whether a finished reply is worth keeping in conversation memory.

use crate::config::PolicyConfig;
use crate::error::CoreError;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistDecision {
    Persist,
    RejectEmpty,
    RejectRefusal,
    RejectNoise,
}

impl PersistDecision {
    pub fn should_persist(self) -> bool {
        self == PersistDecision::Persist
    }
}

#[derive(Debug, Clone)]
pub struct PersistencePolicy {
    min_chars: usize,
    refusal_patterns: Vec<String>,
    noise_patterns: Vec<Regex>,
}

impl PersistencePolicy {
    pub fn new(config: &PolicyConfig) -> Result<Self, CoreError> {
        let noise_patterns = config
            .noise_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    CoreError::Config(format!("Invalid noise pattern '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            min_chars: config.min_chars,
            refusal_patterns: config
                .refusal_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            noise_patterns,
        })
    }

    /// Never fails: a rejected reply is still delivered, only not remembered.
    pub fn evaluate(&self, text: &str) -> PersistDecision {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return PersistDecision::RejectEmpty;
        }

        let lower = trimmed.to_lowercase();
        if self.refusal_patterns.iter().any(|p| lower.contains(p.as_str())) {
            return PersistDecision::RejectRefusal;
        }

        if trimmed.chars().count() < self.min_chars
            || self.noise_patterns.iter().any(|re| re.is_match(trimmed))
        {
            return PersistDecision::RejectNoise;
        }

        PersistDecision::Persist
    }
}
