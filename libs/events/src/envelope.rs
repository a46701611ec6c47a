//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use orbit_id::EventId;
use serde::{Deserialize, Serialize};

use crate::{EventError, FleetEvent};

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    #[default]
    Isolate,
    Node,
    Component,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Isolate => "isolate",
            AggregateType::Node => "node",
            AggregateType::Component => "component",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Monotonic event identifier, per orchestrator run.
    pub event_id: EventId,

    /// When the event was emitted.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// The ID of the aggregate instance.
    pub aggregate_id: String,

    /// The event type (e.g., "placement.changed").
    pub event_type: String,

    /// Event-specific payload.
    pub payload: P,
}

impl EventEnvelope<FleetEvent> {
    /// Wraps a fleet event, deriving the aggregate and type from it.
    pub fn wrap(event_id: EventId, event: FleetEvent) -> Self {
        let (aggregate_type, aggregate_id) = event.aggregate();
        Self {
            event_id,
            occurred_at: Utc::now(),
            aggregate_type,
            aggregate_id,
            event_type: event.event_type().to_string(),
            payload: event,
        }
    }

    /// Encodes the envelope for an external subscriber.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope, rejecting one whose `event_type` disagrees with
    /// its payload.
    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        let envelope: Self = serde_json::from_str(raw)?;
        let expected = envelope.payload.event_type();
        if envelope.event_type != expected {
            return Err(EventError::TypeMismatch {
                declared: envelope.event_type,
                payload: expected,
            });
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IsolateState, IsolateStateChangedPayload, PlacementChangedPayload, PlacementStatus};

    #[test]
    fn test_aggregate_type_display() {
        assert_eq!(AggregateType::Isolate.to_string(), "isolate");
        assert_eq!(AggregateType::Component.to_string(), "component");
    }

    #[test]
    fn test_wrap_fleet_event() {
        let event = FleetEvent::IsolateStateChanged(IsolateStateChangedPayload {
            isolate_id: "iso-A".parse().unwrap(),
            node: "n1".parse().unwrap(),
            old_state: Some(IsolateState::Running),
            new_state: IsolateState::Lost,
        });
        let envelope = EventEnvelope::wrap(EventId::new(7), event);
        assert_eq!(envelope.aggregate_id, "iso-A");
        assert_eq!(envelope.event_type, "isolate.state_changed");
        assert_eq!(envelope.event_id.value(), 7);
    }

    fn placement() -> FleetEvent {
        FleetEvent::PlacementChanged(PlacementChangedPayload {
            component: "c1".parse().unwrap(),
            composition: "app".parse().unwrap(),
            old_isolate: None,
            new_isolate: Some("iso-B".parse().unwrap()),
            status: PlacementStatus::Assigned,
            score: Some(0.75),
            reason: None,
        })
    }

    #[test]
    fn test_json_decodes_what_it_encodes() {
        let envelope = EventEnvelope::wrap(EventId::new(3), placement());
        let raw = envelope.to_json().unwrap();
        assert!(raw.contains("\"event_type\":\"placement.changed\""));
        assert_eq!(EventEnvelope::from_json(&raw).unwrap(), envelope);
    }

    #[test]
    fn test_from_json_rejects_mismatched_type() {
        let mut envelope = EventEnvelope::wrap(EventId::new(3), placement());
        envelope.event_type = "isolate.state_changed".to_string();
        let raw = envelope.to_json().unwrap();
        assert_eq!(
            EventEnvelope::from_json(&raw).unwrap_err(),
            EventError::TypeMismatch {
                declared: "isolate.state_changed".to_string(),
                payload: "placement.changed",
            }
        );
    }

    #[test]
    fn test_from_json_reports_malformed_input() {
        let err = EventEnvelope::from_json("{\"event_id\": 1}").unwrap_err();
        assert!(matches!(err, EventError::Serialization(_)));
    }
}
