//! Typed name and ID definitions for fleet resources.
//!
//! Names are operator- or isolate-chosen labels. Command IDs are ULID-based
//! for sortability and uniqueness.

use crate::{define_id, define_name};

// =============================================================================
// Fleet Topology
// =============================================================================

define_name!(NodeName, "node name");
define_name!(IsolateId, "isolate id");
define_name!(RuntimeKind, "runtime kind");

// =============================================================================
// Compositions
// =============================================================================

define_name!(CompositionName, "composition name");
define_name!(ComponentName, "component name");
define_name!(FactoryName, "factory name");

// =============================================================================
// Commands
// =============================================================================

define_id!(CommandId, "cmd");

// =============================================================================
// Events
// =============================================================================

/// Event ID is a simple monotonic integer, not ULID-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(u64);

impl EventId {
    /// Creates a new EventId from a u64.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next event ID.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================
