//! Composer: decides where components run.
//!
//! The [`Distributor`] filters candidates through the catalog and hard
//! constraints, then ranks them with a [`CriteriaSet`]. Both are pure with
//! respect to fleet state; the orchestrator loop applies their decisions.

pub mod criteria;
mod distributor;

pub use criteria::{
    CrashAffinity, CriteriaSet, Criterion, Distance, History, Reliability, Responsiveness,
};
pub use distributor::{Decision, Distributor, FleetView};
