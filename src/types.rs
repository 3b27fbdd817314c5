//! Shared identifiers and operation kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Requester identity (a chat user).
pub type OwnerId = String;

/// Shared resource identity (a chat channel).
pub type ResourceId = String;

/// Kind of work an owner can have in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Llm,
    Imagine,
    Reimagine,
    Upscale,
    AskNetricsa,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Llm => "llm",
            OperationKind::Imagine => "imagine",
            OperationKind::Reimagine => "reimagine",
            OperationKind::Upscale => "upscale",
            OperationKind::AskNetricsa => "ask-netricsa",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External image-service operations tracked by the generation registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Imagine,
    Reimagine,
    Upscale,
}

impl GenerationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationKind::Imagine => "imagine",
            GenerationKind::Reimagine => "reimagine",
            GenerationKind::Upscale => "upscale",
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<GenerationKind> for OperationKind {
    fn from(kind: GenerationKind) -> Self {
        match kind {
            GenerationKind::Imagine => OperationKind::Imagine,
            GenerationKind::Reimagine => OperationKind::Reimagine,
            GenerationKind::Upscale => OperationKind::Upscale,
        }
    }
}
