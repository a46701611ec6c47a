//! Read-only views of fleet state, captured at event boundaries.

use std::time::Duration;

use orbit_events::{IsolateState, PendingReason, PlacementStatus};
use orbit_id::{ComponentName, CompositionName, FactoryName, IsolateId, NodeName, RuntimeKind};
use orbit_reconcile::Timestamp;
use serde::Serialize;

use crate::model::ComponentSpec;
use crate::orchestrator::FleetState;

/// Where a component currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PlacementView {
    Assigned(IsolateId),
    Pending(PendingReason),
    Failed(PendingReason),
    /// No such component is declared.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolateView {
    pub id: IsolateId,
    pub node: NodeName,
    pub kind: RuntimeKind,
    pub state: IsolateState,
    pub last_heartbeat: Timestamp,
    /// Decayed crash count at capture time.
    pub crash_count: f64,
    pub hosted_components: Vec<ComponentName>,
    pub factories: Vec<FactoryName>,
    /// Restart supervision gave up on this isolate.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub name: NodeName,
    pub reachable: bool,
    pub isolates: Vec<IsolateId>,
}

/// A component that is not Assigned, with the reason why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingComponent {
    pub spec: ComponentSpec,
    pub composition: CompositionName,
    pub status: PlacementStatus,
    pub reason: PendingReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementRecord {
    pub spec: ComponentSpec,
    pub composition: CompositionName,
    pub status: PlacementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolate: Option<IsolateId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<PendingReason>,
}

impl PlacementRecord {
    pub fn view(&self) -> PlacementView {
        let reason = self.reason.unwrap_or(PendingReason::AwaitingPlacement);
        match (self.status, &self.isolate) {
            (PlacementStatus::Assigned, Some(isolate)) => PlacementView::Assigned(isolate.clone()),
            (PlacementStatus::Failed, _) => PlacementView::Failed(reason),
            _ => PlacementView::Pending(reason),
        }
    }
}

/// Copy of the fleet taken between two events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub taken_at: Timestamp,
    /// Events processed when the snapshot was taken.
    pub sequence: u64,
    pub isolates: Vec<IsolateView>,
    pub nodes: Vec<NodeView>,
    /// In declaration order.
    pub placements: Vec<PlacementRecord>,
}

impl FleetSnapshot {
    pub fn capture(
        state: &FleetState,
        crash_half_life: Duration,
        sequence: u64,
        now: Timestamp,
    ) -> Self {
        let registry = state.registry();
        let isolates = registry
            .isolates()
            .map(|i| IsolateView {
                id: i.id.clone(),
                node: i.node.clone(),
                kind: i.kind.clone(),
                state: i.state,
                last_heartbeat: i.last_heartbeat,
                crash_count: i.crash_count.value_at(now, crash_half_life),
                hosted_components: i.hosted_components.iter().cloned().collect(),
                factories: state.catalog().factories(&i.id),
                degraded: state.restarts().is_degraded(&i.id),
            })
            .collect();
        let nodes = registry
            .nodes()
            .map(|n| NodeView {
                name: n.name.clone(),
                reachable: n.reachable,
                isolates: registry
                    .isolates()
                    .filter(|i| i.node == n.name)
                    .map(|i| i.id.clone())
                    .collect(),
            })
            .collect();
        let placements = state
            .table()
            .entries()
            .into_iter()
            .map(|e| PlacementRecord {
                spec: e.spec.clone(),
                composition: e.composition.clone(),
                status: e.status,
                isolate: e.isolate.clone(),
                score: e.score,
                reason: e.reason,
            })
            .collect();

        Self {
            taken_at: now,
            sequence,
            isolates,
            nodes,
            placements,
        }
    }

    pub fn get_placement(&self, component: &ComponentName) -> PlacementView {
        self.placements
            .iter()
            .find(|p| p.spec.name == *component)
            .map_or(PlacementView::Unknown, PlacementRecord::view)
    }

    /// Isolates, optionally only those on `node`.
    pub fn list_isolates(&self, node: Option<&NodeName>) -> Vec<IsolateView> {
        self.isolates
            .iter()
            .filter(|i| node.is_none_or(|n| i.node == *n))
            .cloned()
            .collect()
    }

    /// Pending and Failed components, in declaration order.
    pub fn list_pending_components(&self) -> Vec<PendingComponent> {
        self.placements
            .iter()
            .filter(|p| p.status != PlacementStatus::Assigned)
            .map(|p| PendingComponent {
                spec: p.spec.clone(),
                composition: p.composition.clone(),
                status: p.status,
                reason: p.reason.unwrap_or(PendingReason::AwaitingPlacement),
            })
            .collect()
    }

    pub fn list_nodes(&self) -> Vec<NodeView> {
        self.nodes.clone()
    }

    /// component -> isolate for every Assigned component.
    pub fn assignments(&self) -> Vec<(ComponentName, IsolateId)> {
        self.placements
            .iter()
            .filter_map(|p| match p.view() {
                PlacementView::Assigned(isolate) => Some((p.spec.name.clone(), isolate)),
                _ => None,
            })
            .collect()
    }
}
