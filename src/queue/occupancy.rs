//! Which owners currently hold a place in the queue, and for what.

use crate::types::{OperationKind, OwnerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyEntry {
    pub owner: OwnerId,
    pub kind: OperationKind,
    pub elapsed: Duration,
}

/// Owner-keyed occupancy tracker used to refuse a second concurrent request
/// from the same owner.
#[derive(Default)]
pub struct QueueOccupancy {
    owners: RwLock<HashMap<OwnerId, (OperationKind, Instant)>>,
}

impl QueueOccupancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `owner` as queued for `kind`. Returns `false` (and changes nothing)
    /// if the owner already holds a place.
    pub fn try_add(&self, owner: &str, kind: OperationKind) -> bool {
        let mut owners = self.owners.write();
        if owners.contains_key(owner) {
            return false;
        }
        owners.insert(owner.to_string(), (kind, Instant::now()));
        info!(owner = %owner, kind = %kind, queue_size = owners.len(), "Owner added to queue");
        true
    }

    pub fn remove(&self, owner: &str) {
        let mut owners = self.owners.write();
        if let Some((kind, since)) = owners.remove(owner) {
            info!(
                owner = %owner,
                kind = %kind,
                duration_ms = since.elapsed().as_millis(),
                queue_size = owners.len(),
                "Owner removed from queue"
            );
        }
    }

    pub fn contains(&self, owner: &str) -> bool {
        self.owners.read().contains_key(owner)
    }

    pub fn operation_of(&self, owner: &str) -> Option<OperationKind> {
        self.owners.read().get(owner).map(|(kind, _)| *kind)
    }

    pub fn len(&self) -> usize {
        self.owners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<OccupancyEntry> {
        let mut entries: Vec<OccupancyEntry> = self
            .owners
            .read()
            .iter()
            .map(|(owner, (kind, since))| OccupancyEntry {
                owner: owner.clone(),
                kind: *kind,
                elapsed: since.elapsed(),
            })
            .collect();
        entries.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
        entries
    }
}
