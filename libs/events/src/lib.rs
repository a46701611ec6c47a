//! # orbit-events
//!
//! Event type definitions for the orbit fleet orchestrator.
//!
//! ## Design Principles
//!
//! - Events are immutable records of state transitions that already happened
//!   inside the orchestrator loop
//! - Every event belongs to exactly one aggregate (an isolate, a node or a
//!   component placement)
//! - Delivery to subscribers is best-effort; events are notifications, not the
//!   source of truth (the query API is)
//!
//! ## Event Envelope
//!
//! All events share a common envelope with:
//! - Global ordering (`event_id`)
//! - Aggregate identity (`aggregate_type`, `aggregate_id`)
//! - Wall-clock time of emission (`occurred_at`)
//!
//! ## Event Types
//!
//! - Isolate events (`isolate.*`)
//! - Node events (`node.*`)
//! - Placement events (`placement.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
