//! Inbound events and the priority queue they wait in.

use std::collections::VecDeque;

use orbit_id::{
    CommandId, ComponentName, CompositionName, FactoryName, IsolateId, NodeName, RuntimeKind,
};
use orbit_reconcile::Timestamp;

use crate::model::{ComponentSpec, Composition};

/// Registration handshake of an isolate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub isolate: IsolateId,
    pub node: NodeName,
    pub kind: RuntimeKind,
    pub factories: Vec<FactoryName>,
    pub at: Timestamp,
}

/// Outcome reported by an isolate for a placement command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    Rejected(String),
}

/// Everything the orchestrator loop reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Isolate liveness
    Register(Registration),
    Heartbeat {
        isolate: IsolateId,
        at: Timestamp,
    },
    Shutdown {
        isolate: IsolateId,
    },

    // Derived
    IsolateJoined {
        isolate: IsolateId,
    },
    IsolateLost {
        isolate: IsolateId,
        /// Components forced Pending when the isolate was lost.
        displaced: Vec<ComponentName>,
    },

    // Compositions
    LoadComposition(Composition),
    UnloadComposition(CompositionName),
    ComponentsAdded {
        composition: CompositionName,
        specs: Vec<ComponentSpec>,
    },
    ComponentsRemoved {
        composition: CompositionName,
        names: Vec<ComponentName>,
    },

    // Command resolution
    PlacementAck {
        command: CommandId,
        outcome: AckOutcome,
    },
    PlacementTimeout {
        command: CommandId,
    },

    // Periodic
    Sweep,
    Rescan,
}

/// Processing priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    IsolateLost = 0,
    IsolateJoined = 1,
    CompositionLoaded = 2,
    Placement = 3,
    Periodic = 4,
}

impl Priority {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }
}

impl Event {
    pub fn priority(&self) -> Priority {
        match self {
            Event::IsolateLost { .. } | Event::Shutdown { .. } => Priority::IsolateLost,
            Event::IsolateJoined { .. } | Event::Register(_) | Event::Heartbeat { .. } => {
                Priority::IsolateJoined
            }
            Event::LoadComposition(_)
            | Event::UnloadComposition(_)
            | Event::ComponentsAdded { .. }
            | Event::ComponentsRemoved { .. } => Priority::CompositionLoaded,
            Event::PlacementAck { .. } | Event::PlacementTimeout { .. } => Priority::Placement,
            Event::Sweep | Event::Rescan => Priority::Periodic,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Register(_) => "register",
            Event::Heartbeat { .. } => "heartbeat",
            Event::Shutdown { .. } => "shutdown",
            Event::IsolateJoined { .. } => "isolate_joined",
            Event::IsolateLost { .. } => "isolate_lost",
            Event::LoadComposition(_) => "load_composition",
            Event::UnloadComposition(_) => "unload_composition",
            Event::ComponentsAdded { .. } => "components_added",
            Event::ComponentsRemoved { .. } => "components_removed",
            Event::PlacementAck { .. } => "placement_ack",
            Event::PlacementTimeout { .. } => "placement_timeout",
            Event::Sweep => "sweep",
            Event::Rescan => "rescan",
        }
    }
}

/// One FIFO per priority class.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    classes: [VecDeque<Event>; Priority::COUNT],
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.classes[event.priority().index()].push_back(event);
    }

    /// Oldest event of the highest non-empty class.
    pub fn pop(&mut self) -> Option<Event> {
        self.classes.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(VecDeque::is_empty)
    }
}
