//! Isolate registry: the nodes and isolates the orchestrator knows about.
//!
//! Isolates are never deleted. Explicit shutdown tombstones them as
//! `Stopped`; crash history survives every transition.

use std::collections::{BTreeMap, BTreeSet};

use orbit_events::IsolateState;
use orbit_id::{ComponentName, IsolateId, NodeName, RuntimeKind};
use orbit_reconcile::{DecayingCounter, Timestamp};
use serde::Serialize;

/// A logical host machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub name: NodeName,
    /// True iff at least one isolate on the node is Running.
    pub reachable: bool,
}

/// A supervised process able to host components.
#[derive(Debug, Clone, PartialEq)]
pub struct Isolate {
    pub id: IsolateId,
    pub node: NodeName,
    pub kind: RuntimeKind,
    pub state: IsolateState,
    pub last_heartbeat: Timestamp,
    pub crash_count: DecayingCounter,
    pub hosted_components: BTreeSet<ComponentName>,
}

impl Isolate {
    pub fn is_running(&self) -> bool {
        self.state == IsolateState::Running
    }
}

/// Result of applying a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// `last_heartbeat` was advanced (or already at least as recent).
    Applied,
    /// No isolate with this id was ever registered.
    Unknown,
    /// The isolate is tombstoned.
    Stopped,
}

/// Nodes and isolates, keyed for deterministic iteration.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    nodes: BTreeMap<NodeName, Node>,
    isolates: BTreeMap<IsolateId, Isolate>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or revives an isolate in the `Registering` state.
    ///
    /// Returns the previous state, or `None` for a first registration. The
    /// hosted set is left untouched; the caller rebuilds it from the table.
    pub fn upsert(
        &mut self,
        id: &IsolateId,
        node: &NodeName,
        kind: &RuntimeKind,
        at: Timestamp,
    ) -> (Option<IsolateState>, Option<NodeName>) {
        self.nodes.entry(node.clone()).or_insert_with(|| Node {
            name: node.clone(),
            reachable: false,
        });

        match self.isolates.get_mut(id) {
            Some(isolate) => {
                let previous = isolate.state;
                let moved_from = (isolate.node != *node).then(|| isolate.node.clone());
                isolate.node = node.clone();
                isolate.kind = kind.clone();
                isolate.state = IsolateState::Registering;
                isolate.last_heartbeat = at;
                (Some(previous), moved_from)
            }
            None => {
                self.isolates.insert(
                    id.clone(),
                    Isolate {
                        id: id.clone(),
                        node: node.clone(),
                        kind: kind.clone(),
                        state: IsolateState::Registering,
                        last_heartbeat: at,
                        crash_count: DecayingCounter::new(at),
                        hosted_components: BTreeSet::new(),
                    },
                );
                (None, None)
            }
        }
    }

    /// Applies a heartbeat idempotently: `last_heartbeat = max(current, at)`.
    pub fn heartbeat(&mut self, id: &IsolateId, at: Timestamp) -> HeartbeatOutcome {
        match self.isolates.get_mut(id) {
            None => HeartbeatOutcome::Unknown,
            Some(isolate) if isolate.state == IsolateState::Stopped => HeartbeatOutcome::Stopped,
            Some(isolate) => {
                isolate.last_heartbeat = isolate.last_heartbeat.max(at);
                HeartbeatOutcome::Applied
            }
        }
    }

    /// Sets the state of an isolate, returning the previous one.
    pub fn set_state(&mut self, id: &IsolateId, state: IsolateState) -> Option<IsolateState> {
        let isolate = self.isolates.get_mut(id)?;
        Some(std::mem::replace(&mut isolate.state, state))
    }

    /// Recomputes the reachable flag of `node`.
    ///
    /// Returns the new value if it changed.
    pub fn refresh_reachability(&mut self, node: &NodeName) -> Option<bool> {
        let reachable = self
            .isolates
            .values()
            .any(|i| i.node == *node && i.is_running());
        let entry = self.nodes.get_mut(node)?;
        if entry.reachable == reachable {
            return None;
        }
        entry.reachable = reachable;
        Some(reachable)
    }

    pub fn get(&self, id: &IsolateId) -> Option<&Isolate> {
        self.isolates.get(id)
    }

    pub fn get_mut(&mut self, id: &IsolateId) -> Option<&mut Isolate> {
        self.isolates.get_mut(id)
    }

    /// All isolates in id order.
    pub fn isolates(&self) -> impl Iterator<Item = &Isolate> {
        self.isolates.values()
    }

    /// Running isolates in id order.
    pub fn running(&self) -> impl Iterator<Item = &Isolate> {
        self.isolates.values().filter(|i| i.is_running())
    }

    /// All nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node(&self, name: &NodeName) -> Option<&Node> {
        self.nodes.get(name)
    }
}
