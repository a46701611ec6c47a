//! The orchestrator loop.
//!
//! [`Orchestrator`] owns all fleet state and consumes events strictly one at
//! a time, highest priority first. After every event that can change
//! placement the invariants are checked; a step that breaks one is rolled
//! back to the state before the event, including its commands,
//! notifications and derived events. Events that cannot change placement
//! (heartbeats, accepted acks, no-op sweeps and the like) are applied in
//! place.
//!
//! The loop itself performs no I/O. Commands accumulate in an outbox that
//! the [`worker`] drains and dispatches.

mod events;
mod state;
pub mod worker;

use std::time::Duration;

use orbit_events::FleetEvent;
use orbit_reconcile::Timestamp;
use tracing::{debug, error};

pub use events::{AckOutcome, Event, EventQueue, Priority, Registration};
pub use state::{FleetState, Outstanding};
pub use worker::{start, Clock, OrchestratorHandle};

use crate::composer::{CriteriaSet, Distributor, History};
use crate::config::Config;
use crate::error::InvariantViolation;
use crate::forker::{LivenessTracker, RestartSupervisor};
use crate::snapshot::FleetSnapshot;
use crate::transport::Command;
use state::Rules;

/// Outcome of one processed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub event: &'static str,
    /// Set when the event was rolled back.
    pub violation: Option<InvariantViolation>,
}

/// Counters over the lifetime of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub processed: u64,
    /// Events run inside a checked transaction.
    pub checked: u64,
    pub rolled_back: u64,
}

/// Sequential owner of the registry, catalog and placement table.
#[derive(Debug)]
pub struct Orchestrator {
    rules: Rules,
    state: FleetState,
    queue: EventQueue,
    stats: Stats,
    crash_half_life: Duration,
}

impl Orchestrator {
    /// Create an orchestrator with the built-in criteria.
    pub fn new(config: &Config) -> Self {
        Self::with_criteria(config, CriteriaSet::from_config(config))
    }

    /// Create an orchestrator with a custom criteria list.
    pub fn with_criteria(config: &Config, criteria: CriteriaSet) -> Self {
        Self {
            rules: Rules {
                distributor: Distributor::new(criteria),
                liveness: LivenessTracker::new(
                    config.heartbeat_timeout(),
                    config.crash_half_life(),
                ),
                command_timeout: config.command_timeout(),
            },
            state: FleetState::new(
                History::new(config.latency_window),
                RestartSupervisor::new(config.restart.policy()),
            ),
            queue: EventQueue::new(),
            stats: Stats::default(),
            crash_half_life: config.crash_half_life(),
        }
    }

    /// Queue an event for processing.
    pub fn submit(&mut self, event: Event) {
        self.queue.push(event);
    }

    /// Process the highest-priority queued event, if any.
    pub fn process_next(&mut self, now: Timestamp) -> Option<Step> {
        let event = self.queue.pop()?;
        let name = event.name();
        debug!(event = name, queued = self.queue.len(), "Processing event");

        let rules = &self.rules;
        self.stats.processed += 1;
        if !self.state.can_change_placement(rules, &event, now) {
            let mut derived = Vec::new();
            let violation = self.state.apply(rules, event, now, &mut derived).err();
            for event in derived {
                self.queue.push(event);
            }
            return Some(Step {
                event: name,
                violation,
            });
        }

        let context = format!("{event:?}");
        let result = Self::transact(&mut self.state, &mut self.queue, |state, derived| {
            state.apply(rules, event, now, derived)
        });
        self.stats.checked += 1;

        let violation = result.err();
        if let Some(v) = &violation {
            self.stats.rolled_back += 1;
            error!(
                event = name,
                context = %context,
                violation = %v,
                "Invariant violation, event rolled back"
            );
        }
        Some(Step {
            event: name,
            violation,
        })
    }

    /// Process events until the queue is empty, returning how many ran.
    pub fn run_until_idle(&mut self, now: Timestamp) -> usize {
        let mut steps = 0;
        while self.process_next(now).is_some() {
            steps += 1;
        }
        steps
    }

    /// Submit one event and run to idle.
    pub fn handle(&mut self, event: Event, now: Timestamp) -> usize {
        self.submit(event);
        self.run_until_idle(now)
    }

    /// Runs `f` against the state, keeping its effects only if the
    /// invariants hold afterwards.
    fn transact<F>(
        state: &mut FleetState,
        queue: &mut EventQueue,
        f: F,
    ) -> Result<(), InvariantViolation>
    where
        F: FnOnce(&mut FleetState, &mut Vec<Event>) -> Result<(), InvariantViolation>,
    {
        let before = state.clone();
        let mut derived = Vec::new();
        match f(state, &mut derived).and_then(|()| state.check_invariants()) {
            Ok(()) => {
                for event in derived {
                    queue.push(event);
                }
                Ok(())
            }
            Err(violation) => {
                *state = before;
                Err(violation)
            }
        }
    }

    /// Take the commands produced since the last call.
    pub fn drain_outbox(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.state.outbox)
    }

    /// Take the notifications produced since the last call.
    pub fn drain_notifications(&mut self) -> Vec<FleetEvent> {
        std::mem::take(&mut self.state.notifications)
    }

    pub fn state(&self) -> &FleetState {
        &self.state
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn snapshot(&self, now: Timestamp) -> FleetSnapshot {
        FleetSnapshot::capture(&self.state, self.crash_half_life, self.stats.processed, now)
    }
}
