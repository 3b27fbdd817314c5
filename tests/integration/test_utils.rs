//! Shared test utilities for integration tests
//!
//! Recording doubles for the three collaborators the core talks to (the
//! sink, the remote-cancel transport and the chat source), plus isolation of
//! the environment variables the config loader reads.

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use netricsa::error::CoreError;
use netricsa::provider::{ChatRequest, ChatSource};
use netricsa::registry::{CancelAck, MarkerTarget, RemoteCancel};
use netricsa::stream::{ChunkSource, OutputSink, SinkUnitId};
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// One call received by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Create(String),
    Update(u64, String),
}

/// Sink that records every mutation and keeps the current unit contents.
#[derive(Default)]
pub struct RecordingSink {
    units: Mutex<Vec<String>>,
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn units(&self) -> Vec<String> {
        self.units.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl OutputSink for RecordingSink {
    async fn create_unit(&self, content: &str) -> Result<SinkUnitId, CoreError> {
        let mut units = self.units.lock().unwrap();
        units.push(content.to_string());
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Create(content.to_string()));
        Ok(SinkUnitId(units.len() as u64 - 1))
    }

    async fn update_unit(&self, id: SinkUnitId, content: &str) -> Result<(), CoreError> {
        let mut units = self.units.lock().unwrap();
        let slot = units
            .get_mut(id.0 as usize)
            .ok_or_else(|| CoreError::Sink(format!("unknown unit {}", id.0)))?;
        *slot = content.to_string();
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Update(id.0, content.to_string()));
        Ok(())
    }
}

/// Remote-cancel transport that reports cancelled ids on a channel and
/// records marker writes.
pub struct RecordingCancel {
    cancelled: mpsc::UnboundedSender<String>,
    markers: Mutex<Vec<MarkerTarget>>,
    flags_dir: PathBuf,
}

impl RecordingCancel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                cancelled: tx,
                markers: Mutex::new(Vec::new()),
                flags_dir: PathBuf::from("flags"),
            },
            rx,
        )
    }

    pub fn markers(&self) -> Vec<MarkerTarget> {
        self.markers.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteCancel for RecordingCancel {
    async fn cancel_job(&self, remote_id: &str) -> Result<CancelAck, CoreError> {
        let _ = self.cancelled.send(remote_id.to_string());
        Ok(CancelAck::default())
    }

    fn write_cancel_marker(&self, target: &MarkerTarget) -> Result<PathBuf, CoreError> {
        self.markers.lock().unwrap().push(target.clone());
        Ok(netricsa::registry::cancel::marker_path(&self.flags_dir, target))
    }
}

/// One NDJSON chat line carrying `content`.
pub fn chat_line(content: &str) -> Bytes {
    let line = serde_json::json!({
        "message": { "role": "assistant", "content": content },
        "done": false,
    });
    Bytes::from(format!("{}\n", line))
}

/// The closing NDJSON line with usage counters.
pub fn done_line(prompt_eval_count: u64, eval_count: u64) -> Bytes {
    let line = serde_json::json!({
        "message": { "role": "assistant", "content": "" },
        "done": true,
        "prompt_eval_count": prompt_eval_count,
        "eval_count": eval_count,
    });
    Bytes::from(format!("{}\n", line))
}

/// A finished source yielding `pieces` as chat lines, then a done line.
pub fn scripted_source(pieces: &[&str]) -> ChunkSource {
    let mut chunks: Vec<Result<Bytes, CoreError>> =
        pieces.iter().map(|p| Ok(chat_line(p))).collect();
    chunks.push(Ok(done_line(12, pieces.len() as u64)));
    futures::stream::iter(chunks).boxed()
}

/// A source fed by the test through the returned sender.
pub fn channel_source() -> (fmpsc::UnboundedSender<Result<Bytes, CoreError>>, ChunkSource) {
    let (tx, rx) = fmpsc::unbounded();
    (tx, rx.boxed())
}

/// Chat source that serves pre-scripted replies in order and records the
/// requests it received.
#[derive(Default)]
pub struct ScriptedChat {
    replies: Mutex<Vec<ChunkSource>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<ChunkSource>) -> Self {
        let mut replies = replies;
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .and_then(|r| r.messages.last())
            .map(|m| m.content.clone())
    }
}

#[async_trait]
impl ChatSource for ScriptedChat {
    async fn open_stream(&self, request: ChatRequest) -> Result<ChunkSource, CoreError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| CoreError::Transport("connection refused".to_string()))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Serializes access to process environment variables across tests.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const ISOLATED_VARS: &[&str] = &["HOME", "XDG_CONFIG_HOME", "NETRICSA_ENV"];

/// Run `f` with HOME and XDG_CONFIG_HOME pointing into `test_dir`, and
/// `extra` variables set; everything is restored afterwards.
pub fn with_config_env<F, R>(test_dir: &TempDir, extra: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let mut names: Vec<&str> = ISOLATED_VARS.to_vec();
    names.extend(extra.iter().map(|(name, _)| *name));
    let saved: Vec<(String, Option<String>)> = names
        .iter()
        .map(|name| (name.to_string(), std::env::var(name).ok()))
        .collect();

    let home = test_dir.path().join("home");
    std::fs::create_dir_all(&home).unwrap();
    std::env::set_var("HOME", &home);
    std::env::set_var("XDG_CONFIG_HOME", test_dir.path().join("xdg"));
    std::env::remove_var("NETRICSA_ENV");
    for (name, value) in extra {
        std::env::set_var(name, value);
    }

    let result = f();

    for (name, value) in saved {
        match value {
            Some(value) => std::env::set_var(&name, value),
            None => std::env::remove_var(&name),
        }
    }
    result
}
