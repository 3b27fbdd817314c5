//! Newline-delimited JSON decoding of streamed model output.
//!
//! A network chunk may end in the middle of a line, or in the middle of a
//! UTF-8 sequence; the decoder buffers raw bytes until a full line exists.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// One decoded line of the chat stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationChunk {
    pub content: String,
    pub done: bool,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

impl GenerationChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

/// Token counters reported by the model. Later reports replace earlier ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

impl TokenUsage {
    pub fn absorb(&mut self, chunk: &GenerationChunk) {
        if chunk.prompt_eval_count.is_some() {
            self.prompt_eval_count = chunk.prompt_eval_count;
        }
        if chunk.eval_count.is_some() {
            self.eval_count = chunk.eval_count;
        }
    }
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

/// Accepts both the chat (`message.content`) and generate (`response`) shapes.
#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a single NDJSON line.
///
/// An `{"error": ...}` line is a transport failure reported in-band; anything
/// that is not valid JSON is [`CoreError::MalformedChunk`].
pub fn parse_line(line: &str) -> Result<GenerationChunk, CoreError> {
    let wire: WireChunk = serde_json::from_str(line)
        .map_err(|e| CoreError::MalformedChunk(format!("{}: {}", e, truncate(line, 80))))?;

    if let Some(error) = wire.error {
        return Err(CoreError::Transport(format!("Model reported an error: {}", error)));
    }

    let content = match (wire.message, wire.response) {
        (Some(message), _) => message.content,
        (None, Some(response)) => response,
        (None, None) => String::new(),
    };

    Ok(GenerationChunk {
        content,
        done: wire.done,
        prompt_eval_count: wire.prompt_eval_count,
        eval_count: wire.eval_count,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Incremental line splitter over raw stream bytes.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and decode every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<GenerationChunk, CoreError>> {
        self.buffer.extend_from_slice(bytes);

        let mut decoded = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(result) = decode_line(&line) {
                decoded.push(result);
            }
        }
        decoded
    }

    /// Decode whatever is left once the source has ended without a trailing
    /// newline.
    pub fn finish(&mut self) -> Option<Result<GenerationChunk, CoreError>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<Result<GenerationChunk, CoreError>> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(e) => return Some(Err(CoreError::MalformedChunk(format!("Invalid UTF-8: {}", e)))),
    };
    if line.is_empty() {
        None
    } else {
        Some(parse_line(line))
    }
}
