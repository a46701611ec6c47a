//! Restart supervision for lost isolates.

use std::collections::BTreeSet;
use std::time::Duration;

use orbit_id::{IsolateId, NodeName, RuntimeKind};
use orbit_reconcile::{RestartDecision, RestartPolicy, RestartTracker, Timestamp};
use serde::Serialize;
use tracing::{info, warn};

use crate::registry::Isolate;

/// Ask the node to bring an isolate back after `delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartRequest {
    pub isolate: IsolateId,
    pub node: NodeName,
    pub kind: RuntimeKind,
    pub attempt: u32,
    #[serde(with = "orbit_reconcile::duration_ms")]
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Requested(RestartRequest),
    /// Too many restarts inside the window; the isolate is now degraded.
    Degraded { attempts: u32 },
    /// Already degraded; no request until the isolate rejoins.
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct RestartSupervisor {
    tracker: RestartTracker<IsolateId>,
    degraded: BTreeSet<IsolateId>,
}

impl RestartSupervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            tracker: RestartTracker::new(policy),
            degraded: BTreeSet::new(),
        }
    }

    /// Decides what to do about an isolate that just went Lost.
    pub fn on_lost(&mut self, isolate: &Isolate, now: Timestamp) -> RestartOutcome {
        if self.degraded.contains(&isolate.id) {
            return RestartOutcome::Suppressed;
        }

        match self.tracker.record(&isolate.id, now) {
            RestartDecision::Restart { attempt, delay } => {
                info!(
                    isolate_id = %isolate.id,
                    node = %isolate.node,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Requesting isolate restart"
                );
                RestartOutcome::Requested(RestartRequest {
                    isolate: isolate.id.clone(),
                    node: isolate.node.clone(),
                    kind: isolate.kind.clone(),
                    attempt,
                    delay,
                })
            }
            RestartDecision::Exhausted { attempts } => {
                warn!(
                    isolate_id = %isolate.id,
                    node = %isolate.node,
                    attempts,
                    "Restart limit reached, marking isolate degraded"
                );
                self.degraded.insert(isolate.id.clone());
                RestartOutcome::Degraded { attempts }
            }
        }
    }

    /// A rejoining isolate is no longer degraded. Its attempts stay counted.
    pub fn on_rejoined(&mut self, id: &IsolateId, now: Timestamp) {
        self.degraded.remove(id);
        self.tracker.prune(now);
    }

    /// Explicit shutdown forgets restart history.
    pub fn on_stopped(&mut self, id: &IsolateId) {
        self.degraded.remove(id);
        self.tracker.clear(id);
    }

    pub fn is_degraded(&self, id: &IsolateId) -> bool {
        self.degraded.contains(id)
    }
}
