//! Generation Registry
//!
//! Tracks the one in-flight image-service job each owner may have, so that an
//! unrelated control flow (a stop command) can cancel it. The remote job id
//! arrives only after the service accepts the job; a cancel issued before
//! that falls back to the service's durable cancel marker.

pub mod cancel;

use crate::config::MarkerScope;
use crate::periodic::PeriodicHandle;
use crate::types::{GenerationKind, OwnerId, ResourceId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub use cancel::{CancelAck, ImageServiceCancel, MarkerTarget, RemoteCancel};

/// One in-flight external job owned by a requester.
#[derive(Debug)]
pub struct TrackedGeneration {
    pub owner: OwnerId,
    pub resource: ResourceId,
    pub kind: GenerationKind,
    pub remote_id: Option<String>,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    periodic: Option<PeriodicHandle>,
}

impl TrackedGeneration {
    fn stop_periodic(&mut self) {
        if let Some(mut handle) = self.periodic.take() {
            handle.stop();
        }
    }

    fn info(&self) -> GenerationInfo {
        GenerationInfo {
            owner: self.owner.clone(),
            resource: self.resource.clone(),
            kind: self.kind,
            remote_id: self.remote_id.clone(),
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
            has_periodic: self.periodic.is_some(),
        }
    }
}

/// Read-only snapshot of a tracked generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationInfo {
    pub owner: OwnerId,
    pub resource: ResourceId,
    pub kind: GenerationKind,
    pub remote_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub has_periodic: bool,
}

/// Owner-keyed registry of cancellable generations.
pub struct GenerationRegistry {
    active: Mutex<HashMap<OwnerId, TrackedGeneration>>,
    transport: Arc<dyn RemoteCancel>,
    marker_scope: MarkerScope,
}

impl GenerationRegistry {
    pub fn new(transport: Arc<dyn RemoteCancel>, marker_scope: MarkerScope) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            transport,
            marker_scope,
        }
    }

    /// Track a new generation for `owner`, replacing any previous one.
    pub fn register(
        &self,
        owner: &str,
        resource: &str,
        kind: GenerationKind,
        periodic: Option<PeriodicHandle>,
    ) {
        let replaced = {
            let mut active = self.active.lock();
            active.insert(
                owner.to_string(),
                TrackedGeneration {
                    owner: owner.to_string(),
                    resource: resource.to_string(),
                    kind,
                    remote_id: None,
                    started: Instant::now(),
                    started_at: Utc::now(),
                    periodic,
                },
            )
        };
        if let Some(mut previous) = replaced {
            warn!(
                owner = %owner,
                previous_kind = %previous.kind,
                "Replacing an active generation for the same owner"
            );
            previous.stop_periodic();
        }
        debug!(owner = %owner, resource = %resource, kind = %kind, "Generation registered");
    }

    /// Attach the remote job id once the service has accepted the job.
    pub fn update_remote_id(&self, owner: &str, remote_id: &str) {
        let mut active = self.active.lock();
        match active.get_mut(owner) {
            Some(generation) => {
                generation.remote_id = Some(remote_id.to_string());
                debug!(owner = %owner, remote_id = %remote_id, "Remote job id attached");
            }
            None => debug!(
                owner = %owner,
                remote_id = %remote_id,
                "Remote job id arrived for an owner with no active generation"
            ),
        }
    }

    /// Cancel the owner's generation. Returns `false` if there is none.
    ///
    /// Remote cancel requests are best-effort: the entry is removed locally
    /// whatever the service answers, and failures are only logged.
    pub fn cancel(&self, owner: &str) -> bool {
        let (removed, still_unassigned) = {
            let mut active = self.active.lock();
            let removed = active.remove(owner);
            let unassigned = active.values().filter(|g| g.remote_id.is_none()).count();
            (removed, unassigned)
        };

        match removed {
            Some(generation) => {
                self.dispatch_cancel(generation, still_unassigned);
                true
            }
            None => {
                debug!(owner = %owner, "No active generation to cancel");
                false
            }
        }
    }

    /// Cancel generations attached to `resource`.
    ///
    /// Non-privileged requesters may only cancel their own entry; entries of
    /// other owners on the same resource are skipped.
    pub fn cancel_by_resource(&self, resource: &str, requester: &str, privileged: bool) -> bool {
        let (removed, still_unassigned) = {
            let mut active = self.active.lock();
            let targets: Vec<OwnerId> = active
                .values()
                .filter(|g| g.resource == resource)
                .filter(|g| {
                    let allowed = privileged || g.owner == requester;
                    if !allowed {
                        debug!(
                            requester = %requester,
                            owner = %g.owner,
                            resource = %resource,
                            "Requester may not cancel another owner's generation"
                        );
                    }
                    allowed
                })
                .map(|g| g.owner.clone())
                .collect();
            let removed: Vec<TrackedGeneration> = targets
                .iter()
                .filter_map(|owner| active.remove(owner))
                .collect();
            let unassigned = active.values().filter(|g| g.remote_id.is_none()).count();
            (removed, unassigned)
        };

        if removed.is_empty() {
            info!(resource = %resource, requester = %requester, "No generation to cancel in resource");
            return false;
        }
        for generation in removed {
            self.dispatch_cancel(generation, still_unassigned);
        }
        true
    }

    /// Drop the owner's entry on normal completion or error, without any
    /// remote cancel.
    pub fn unregister(&self, owner: &str) {
        let removed = self.active.lock().remove(owner);
        if let Some(mut generation) = removed {
            generation.stop_periodic();
            debug!(
                owner = %owner,
                kind = %generation.kind,
                duration_ms = generation.started.elapsed().as_millis(),
                "Generation unregistered"
            );
        }
    }

    pub fn has_active(&self, owner: &str) -> bool {
        self.active.lock().contains_key(owner)
    }

    pub fn get_active(&self, owner: &str) -> Option<GenerationInfo> {
        self.active.lock().get(owner).map(TrackedGeneration::info)
    }

    pub fn count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn list(&self) -> Vec<GenerationInfo> {
        self.active.lock().values().map(TrackedGeneration::info).collect()
    }

    fn dispatch_cancel(&self, mut generation: TrackedGeneration, still_unassigned: usize) {
        generation.stop_periodic();

        match generation.remote_id.clone() {
            Some(remote_id) => {
                info!(
                    owner = %generation.owner,
                    remote_id = %remote_id,
                    kind = %generation.kind,
                    "Cancelling remote job"
                );
                self.spawn_remote_cancel(remote_id);
            }
            None => {
                if self.marker_scope == MarkerScope::All && still_unassigned > 0 {
                    warn!(
                        owner = %generation.owner,
                        affected = still_unassigned,
                        "Global cancel marker will also stop other generations without a remote id"
                    );
                }
                let target = MarkerTarget {
                    owner: generation.owner.clone(),
                    kind: generation.kind,
                    scope: self.marker_scope,
                };
                match self.transport.write_cancel_marker(&target) {
                    Ok(path) => info!(
                        owner = %generation.owner,
                        marker = %path.display(),
                        "No remote id yet; wrote cancel marker"
                    ),
                    Err(err) => error!(
                        owner = %generation.owner,
                        error = %err,
                        "Failed to write cancel marker"
                    ),
                }
            }
        }

        info!(
            owner = %generation.owner,
            resource = %generation.resource,
            kind = %generation.kind,
            "Generation cancelled"
        );
    }

    fn spawn_remote_cancel(&self, remote_id: String) {
        let transport = Arc::clone(&self.transport);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match transport.cancel_job(&remote_id).await {
                        Ok(ack) => info!(remote_id = %remote_id, response = %ack.body, "Cancel response"),
                        Err(err) => error!(remote_id = %remote_id, error = %err, "Remote cancel failed"),
                    }
                });
            }
            Err(_) => error!(
                remote_id = %remote_id,
                "No async runtime available; remote cancel request not sent"
            ),
        }
    }
}
