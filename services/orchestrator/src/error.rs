//! Error types for the orchestrator.

use orbit_events::IsolateState;
use orbit_id::{ComponentName, CompositionName, IsolateId};
use thiserror::Error;

/// Reasons a composition (or a change to one) is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompositionError {
    #[error("duplicate component name: {0}")]
    DuplicateComponent(ComponentName),

    #[error("component {component} wires field '{field}' to unknown component {target}")]
    DanglingWire {
        component: ComponentName,
        field: String,
        target: ComponentName,
    },

    #[error("invalid composite name '{0}': must be non-empty and contain no '.'")]
    InvalidCompositeName(String),

    #[error("component {component} is already declared by composition {owner}")]
    OwnedElsewhere {
        component: ComponentName,
        owner: CompositionName,
    },

    #[error("composition not loaded: {0}")]
    UnknownComposition(CompositionName),
}

/// A placement table state that must never be observable.
///
/// Raised by the post-event check; the offending event is rolled back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("component {component} is assigned to unknown isolate {isolate}")]
    UnknownIsolate {
        component: ComponentName,
        isolate: IsolateId,
    },

    #[error("component {component} is assigned to isolate {isolate} in state {state}")]
    NotRunning {
        component: ComponentName,
        isolate: IsolateId,
        state: IsolateState,
    },

    #[error("isolate {isolate} does not support the factory of component {component}")]
    Unsupported {
        component: ComponentName,
        isolate: IsolateId,
    },

    #[error("component {component} is assigned to {isolate}, violating its hard constraint")]
    ConstraintBreached {
        component: ComponentName,
        isolate: IsolateId,
    },

    #[error("component {component} is already assigned to {isolate}")]
    AlreadyAssigned {
        component: ComponentName,
        isolate: IsolateId,
    },

    #[error("hosted components of isolate {0} disagree with the placement table")]
    HostedMismatch(IsolateId),
}

/// Errors reported by a [`crate::Transport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("isolate {isolate} rejected the command: {reason}")]
    Rejected { isolate: IsolateId, reason: String },
}

/// Errors returned by [`crate::OrchestratorHandle`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The worker task has exited.
    #[error("orchestrator worker stopped")]
    Stopped,
}
