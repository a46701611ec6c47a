//! Event type definitions for fleet events.
//!
//! Each event type has a corresponding payload struct with the event-specific
//! data. The state enums here are the shared vocabulary between the
//! orchestrator and its subscribers.

use orbit_id::{ComponentName, CompositionName, IsolateId, NodeName};
use serde::{Deserialize, Serialize};

use crate::AggregateType;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Isolate
    pub const ISOLATE_STATE_CHANGED: &str = "isolate.state_changed";

    // Node
    pub const NODE_REACHABILITY_CHANGED: &str = "node.reachability_changed";

    // Placement
    pub const PLACEMENT_CHANGED: &str = "placement.changed";
}

// =============================================================================
// Common Enums
// =============================================================================

/// Lifecycle state of an isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolateState {
    /// Handshake received, factories not yet declared.
    Registering,
    /// Heartbeating and eligible to host components.
    Running,
    /// Heartbeat timed out.
    Lost,
    /// Explicitly shut down (tombstoned).
    Stopped,
}

impl std::fmt::Display for IsolateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IsolateState::Registering => "registering",
            IsolateState::Running => "running",
            IsolateState::Lost => "lost",
            IsolateState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Status of a placement entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStatus {
    Pending,
    Assigned,
    Failed,
}

impl std::fmt::Display for PlacementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlacementStatus::Pending => "pending",
            PlacementStatus::Assigned => "assigned",
            PlacementStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a component is not (or no longer) assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    /// Loaded but not yet considered by the distributor.
    AwaitingPlacement,
    /// Running isolates satisfy the constraint but none supports the factory.
    NoCompatibleIsolate,
    /// No Running isolate satisfies the explicit isolate/node constraint.
    ConstraintUnsatisfiable,
    /// Every compatible isolate is excluded for the current retry round.
    AllCandidatesExcluded,
    /// The hosting isolate was lost.
    IsolateLost,
    /// The hosting isolate was shut down.
    IsolateStopped,
    /// The isolate rejected the placement command.
    CommandFailed,
    /// The placement command was not acknowledged before its deadline.
    CommandTimedOut,
}

impl PendingReason {
    /// The fleet itself cannot host the component right now, independent
    /// of any command outcome.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            PendingReason::NoCompatibleIsolate | PendingReason::ConstraintUnsatisfiable
        )
    }
}

impl std::fmt::Display for PendingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PendingReason::AwaitingPlacement => "awaiting_placement",
            PendingReason::NoCompatibleIsolate => "no_compatible_isolate",
            PendingReason::ConstraintUnsatisfiable => "constraint_unsatisfiable",
            PendingReason::AllCandidatesExcluded => "all_candidates_excluded",
            PendingReason::IsolateLost => "isolate_lost",
            PendingReason::IsolateStopped => "isolate_stopped",
            PendingReason::CommandFailed => "command_failed",
            PendingReason::CommandTimedOut => "command_timed_out",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolateStateChangedPayload {
    pub isolate_id: IsolateId,
    pub node: NodeName,
    /// `None` when the isolate was first registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<IsolateState>,
    pub new_state: IsolateState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReachabilityChangedPayload {
    pub node: NodeName,
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementChangedPayload {
    pub component: ComponentName,
    pub composition: CompositionName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_isolate: Option<IsolateId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_isolate: Option<IsolateId>,
    pub status: PlacementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<PendingReason>,
}

// =============================================================================
// Fleet Event
// =============================================================================

/// Any event published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FleetEvent {
    IsolateStateChanged(IsolateStateChangedPayload),
    NodeReachabilityChanged(NodeReachabilityChangedPayload),
    PlacementChanged(PlacementChangedPayload),
}

impl FleetEvent {
    /// The dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            FleetEvent::IsolateStateChanged(_) => event_types::ISOLATE_STATE_CHANGED,
            FleetEvent::NodeReachabilityChanged(_) => event_types::NODE_REACHABILITY_CHANGED,
            FleetEvent::PlacementChanged(_) => event_types::PLACEMENT_CHANGED,
        }
    }

    /// The aggregate this event belongs to.
    pub fn aggregate(&self) -> (AggregateType, String) {
        match self {
            FleetEvent::IsolateStateChanged(p) => {
                (AggregateType::Isolate, p.isolate_id.to_string())
            }
            FleetEvent::NodeReachabilityChanged(p) => (AggregateType::Node, p.node.to_string()),
            FleetEvent::PlacementChanged(p) => (AggregateType::Component, p.component.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
