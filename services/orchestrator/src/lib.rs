//! orbit fleet orchestrator.
//!
//! Isolates (supervised processes) run on nodes and host components declared
//! by compositions. This crate keeps track of which isolates are alive and
//! decides where every component runs.
//!
//! ## Architecture
//!
//! - **Registry / Catalog**: known nodes and isolates, and which factories
//!   each isolate can instantiate
//! - **Forker**: heartbeat liveness, expiry sweep and restart supervision
//! - **Composer**: weighted criteria and the distributor that picks an
//!   isolate per component
//! - **Placement table**: the authoritative component -> isolate map
//! - **Orchestrator**: the single-owner event loop tying these together,
//!   plus the tokio worker and handle that drive it
//! - **Transport**: the seam to isolate agents (mock in dev)

pub mod catalog;
pub mod composer;
pub mod config;
pub mod error;
pub mod forker;
pub mod model;
pub mod orchestrator;
pub mod placement;
pub mod registry;
pub mod snapshot;
pub mod transport;

pub use config::Config;
pub use error::{CompositionError, InvariantViolation, OrchestratorError, TransportError};
pub use model::{ComponentSpec, Composite, Composition, Constraint};
pub use orchestrator::{start, Event, Orchestrator, OrchestratorHandle, Registration};
pub use snapshot::{FleetSnapshot, PlacementView};
pub use transport::{MockTransport, Transport};
