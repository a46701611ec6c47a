//! Forker: isolate liveness and restart supervision.
//!
//! - [`LivenessTracker`] applies registrations and heartbeats and finds
//!   isolates whose heartbeat has expired.
//! - [`RestartSupervisor`] turns lost isolates into restart requests with
//!   backoff, and gives up on isolates that keep crashing.
//!
//! The tracker is stateless and works on the registry handed in by the
//! orchestrator loop. The supervisor keeps its own restart history and
//! degraded set, which live inside the fleet state and roll back with it.

mod liveness;
mod restart;

pub use liveness::{LivenessTracker, Registered};
pub use restart::{RestartOutcome, RestartRequest, RestartSupervisor};
