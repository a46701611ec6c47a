//! Heartbeat bookkeeping and expiry sweep.

use std::time::Duration;

use orbit_events::IsolateState;
use orbit_id::{IsolateId, NodeName, RuntimeKind};
use orbit_reconcile::Timestamp;
use tracing::debug;

use crate::registry::{HeartbeatOutcome, Registry};

/// Result of a registration, as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub previous: Option<IsolateState>,
    /// Set when the isolate re-registered from a different node.
    pub moved_from: Option<NodeName>,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessTracker {
    timeout: Duration,
    crash_half_life: Duration,
}

impl LivenessTracker {
    pub fn new(timeout: Duration, crash_half_life: Duration) -> Self {
        Self {
            timeout,
            crash_half_life,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn crash_half_life(&self) -> Duration {
        self.crash_half_life
    }

    /// Creates or revives an isolate with `last_heartbeat = at`.
    ///
    /// The isolate is left in `Registering`; the caller declares its factories
    /// and then marks it Running. The crash-count decay clock is rebased so
    /// history carries over.
    pub fn register(
        &self,
        registry: &mut Registry,
        id: &IsolateId,
        node: &NodeName,
        kind: &RuntimeKind,
        at: Timestamp,
    ) -> Registered {
        let (previous, moved_from) = registry.upsert(id, node, kind, at);
        if let Some(isolate) = registry.get_mut(id) {
            isolate.crash_count.rebase(at, self.crash_half_life);
        }
        Registered {
            previous,
            moved_from,
        }
    }

    /// Applies a heartbeat. Unknown and stopped isolates are ignored.
    pub fn heartbeat(&self, registry: &mut Registry, id: &IsolateId, at: Timestamp) -> bool {
        match registry.heartbeat(id, at) {
            HeartbeatOutcome::Applied => true,
            HeartbeatOutcome::Unknown => {
                debug!(isolate_id = %id, "Heartbeat from unknown isolate ignored");
                false
            }
            HeartbeatOutcome::Stopped => {
                debug!(isolate_id = %id, "Heartbeat from stopped isolate ignored");
                false
            }
        }
    }

    /// Running isolates whose last heartbeat is older than the timeout.
    ///
    /// Pure: the registry is not modified. Results are in id order.
    pub fn sweep(&self, registry: &Registry, now: Timestamp) -> Vec<IsolateId> {
        registry
            .running()
            .filter(|i| now.saturating_since(i.last_heartbeat) > self.timeout)
            .map(|i| i.id.clone())
            .collect()
    }

    /// True when the next sweep would find at least one expired isolate.
    pub fn any_expired(&self, registry: &Registry, now: Timestamp) -> bool {
        registry
            .running()
            .any(|i| now.saturating_since(i.last_heartbeat) > self.timeout)
    }

    /// Marks an expired isolate Lost and counts the crash.
    pub fn mark_lost(&self, registry: &mut Registry, id: &IsolateId, now: Timestamp) {
        if let Some(isolate) = registry.get_mut(id) {
            isolate.state = IsolateState::Lost;
            isolate.crash_count.increment(now, self.crash_half_life);
        }
    }
}
