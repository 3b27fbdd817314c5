//! Active Stream Registry
//!
//! One in-flight streamed reply per resource, each carrying the abort token
//! its streaming loop polls between chunks.

use crate::types::{OperationKind, OwnerId, ResourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ActiveStream {
    id: u64,
    owner: OwnerId,
    kind: OperationKind,
    token: CancellationToken,
    started: Instant,
}

/// Proof of registration; pass it back to [`ActiveStreamRegistry::unregister`].
#[derive(Debug, Clone)]
pub struct StreamTicket {
    pub key: ResourceId,
    pub id: u64,
    pub token: CancellationToken,
}

/// Snapshot of one active stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStreamInfo {
    pub key: ResourceId,
    pub owner: OwnerId,
    pub kind: OperationKind,
    pub aborted: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct ActiveStreamRegistry {
    streams: Mutex<HashMap<ResourceId, ActiveStream>>,
    next_id: AtomicU64,
}

impl ActiveStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream for `key`. A stream already registered there is
    /// aborted and replaced.
    pub fn register(&self, key: &str, owner: &str, kind: OperationKind) -> StreamTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = self.streams.lock().insert(
            key.to_string(),
            ActiveStream {
                id,
                owner: owner.to_string(),
                kind,
                token: token.clone(),
                started: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            warn!(key = %key, previous_owner = %previous.owner, "Replacing an active stream");
            previous.token.cancel();
        }
        debug!(key = %key, owner = %owner, kind = %kind, stream_id = id, "Stream registered");
        StreamTicket {
            key: key.to_string(),
            id,
            token,
        }
    }

    /// Set the abort flag of the stream on `key`.
    pub fn abort(&self, key: &str) -> bool {
        let streams = self.streams.lock();
        match streams.get(key) {
            Some(stream) => {
                stream.token.cancel();
                info!(key = %key, owner = %stream.owner, "Stream abort requested");
                true
            }
            None => {
                debug!(key = %key, "No active stream to abort");
                false
            }
        }
    }

    /// Abort the first stream owned by `owner`.
    pub fn abort_owner(&self, owner: &str) -> bool {
        let streams = self.streams.lock();
        match streams.iter().find(|(_, s)| s.owner == owner) {
            Some((key, stream)) => {
                stream.token.cancel();
                info!(key = %key, owner = %owner, "Stream abort requested by owner");
                true
            }
            None => false,
        }
    }

    /// Abort the stream on `key` if `requester` may: privileged requesters
    /// always may, others only for their own stream.
    pub fn abort_resource(&self, key: &str, requester: &str, privileged: bool) -> bool {
        let streams = self.streams.lock();
        let Some(stream) = streams.get(key) else {
            return false;
        };
        if !privileged && stream.owner != requester {
            debug!(
                key = %key,
                requester = %requester,
                owner = %stream.owner,
                "Requester may not abort another owner's stream"
            );
            return false;
        }
        stream.token.cancel();
        info!(key = %key, requester = %requester, "Stream abort requested");
        true
    }

    pub fn is_aborted(&self, key: &str) -> bool {
        self.streams
            .lock()
            .get(key)
            .map(|s| s.token.is_cancelled())
            .unwrap_or(false)
    }

    /// Remove the stream registered with `ticket`; a newer registration on
    /// the same key is left alone.
    pub fn unregister(&self, ticket: &StreamTicket) -> bool {
        let mut streams = self.streams.lock();
        match streams.get(&ticket.key) {
            Some(stream) if stream.id == ticket.id => {
                let duration_ms = stream.started.elapsed().as_millis();
                streams.remove(&ticket.key);
                debug!(key = %ticket.key, stream_id = ticket.id, duration_ms, "Stream unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn list(&self) -> Vec<ActiveStreamInfo> {
        self.streams
            .lock()
            .iter()
            .map(|(key, s)| ActiveStreamInfo {
                key: key.clone(),
                owner: s.owner.clone(),
                kind: s.kind,
                aborted: s.token.is_cancelled(),
                elapsed: s.started.elapsed(),
            })
            .collect()
    }
}
