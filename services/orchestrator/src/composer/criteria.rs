//! Placement criteria.
//!
//! A criterion is a pure scoring function over a (spec, candidate) pair. The
//! [`CriteriaSet`] combines them as a weighted mean, evaluated fresh on every
//! candidate of every round.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

use orbit_id::{ComponentName, IsolateId};
use orbit_reconcile::{RollingAverage, Timestamp};

use crate::config::Config;
use crate::model::ComponentSpec;
use crate::registry::Isolate;

/// Crash groups remembered by [`History`].
const MAX_CRASH_GROUPS: usize = 64;

// =============================================================================
// History
// =============================================================================

/// Observations the criteria read but never write.
#[derive(Debug, Clone)]
pub struct History {
    window: usize,
    latency: BTreeMap<IsolateId, RollingAverage>,
    /// Components that were hosted together on an isolate when it was lost.
    crash_groups: VecDeque<BTreeSet<ComponentName>>,
}

impl History {
    pub fn new(latency_window: usize) -> Self {
        Self {
            window: latency_window,
            latency: BTreeMap::new(),
            crash_groups: VecDeque::new(),
        }
    }

    /// Records a command acknowledgement latency (or a penalty sample).
    pub fn record_latency(&mut self, isolate: &IsolateId, sample: Duration) {
        let window = self.window;
        self.latency
            .entry(isolate.clone())
            .or_insert_with(|| RollingAverage::new(window))
            .push(sample);
    }

    pub fn average_latency(&self, isolate: &IsolateId) -> Option<Duration> {
        self.latency.get(isolate).and_then(RollingAverage::average)
    }

    /// Remembers the components that went down together.
    pub fn record_crash(&mut self, components: impl IntoIterator<Item = ComponentName>) {
        let group: BTreeSet<ComponentName> = components.into_iter().collect();
        if group.len() < 2 {
            return;
        }
        if self.crash_groups.len() == MAX_CRASH_GROUPS {
            self.crash_groups.pop_front();
        }
        self.crash_groups.push_back(group);
    }

    /// Components that crashed together with `component` at least once.
    pub fn crash_partners(&self, component: &ComponentName) -> BTreeSet<&ComponentName> {
        self.crash_groups
            .iter()
            .filter(|g| g.contains(component))
            .flat_map(|g| g.iter())
            .filter(|c| *c != component)
            .collect()
    }
}

// =============================================================================
// Criterion
// =============================================================================

/// A pure scoring function. Scores are clamped to `[0, 1]` by the set.
pub trait Criterion: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn score(
        &self,
        spec: &ComponentSpec,
        isolate: &Isolate,
        history: &History,
        now: Timestamp,
    ) -> f64;
}

/// Prefers the node the spec asks for.
#[derive(Debug, Clone, Copy)]
pub struct Distance {
    /// Score of an isolate on any other node.
    pub base: f64,
}

impl Criterion for Distance {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn score(&self, spec: &ComponentSpec, isolate: &Isolate, _: &History, _: Timestamp) -> f64 {
        match spec.target_node() {
            Some(node) if *node == isolate.node => 1.0,
            _ => self.base,
        }
    }
}

/// Penalizes isolates that crash, with crashes fading over a half-life.
#[derive(Debug, Clone, Copy)]
pub struct Reliability {
    pub half_life: Duration,
}

impl Criterion for Reliability {
    fn name(&self) -> &'static str {
        "reliability"
    }

    fn score(&self, _: &ComponentSpec, isolate: &Isolate, _: &History, now: Timestamp) -> f64 {
        1.0 / (1.0 + isolate.crash_count.value_at(now, self.half_life))
    }
}

/// Prefers isolates that acknowledge commands quickly.
#[derive(Debug, Clone, Copy)]
pub struct Responsiveness {
    pub reference: Duration,
    /// Score of an isolate with no samples yet.
    pub neutral: f64,
}

impl Criterion for Responsiveness {
    fn name(&self) -> &'static str {
        "responsiveness"
    }

    fn score(&self, _: &ComponentSpec, isolate: &Isolate, history: &History, _: Timestamp) -> f64 {
        match history.average_latency(&isolate.id) {
            None => self.neutral,
            Some(avg) => {
                let reference = self.reference.as_secs_f64();
                let total = reference + avg.as_secs_f64();
                if total == 0.0 {
                    1.0
                } else {
                    reference / total
                }
            }
        }
    }
}

/// Keeps apart components that have gone down together before.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrashAffinity;

impl Criterion for CrashAffinity {
    fn name(&self) -> &'static str {
        "crash_affinity"
    }

    fn score(&self, spec: &ComponentSpec, isolate: &Isolate, history: &History, _: Timestamp) -> f64 {
        let partners = history.crash_partners(&spec.name);
        let n = isolate
            .hosted_components
            .iter()
            .filter(|c| partners.contains(c))
            .count();
        1.0 / (1.0 + n as f64)
    }
}

// =============================================================================
// Criteria Set
// =============================================================================

#[derive(Debug)]
struct Weighted {
    criterion: Box<dyn Criterion>,
    weight: f64,
}

/// Ordered, weighted list of criteria.
#[derive(Debug, Default)]
pub struct CriteriaSet {
    entries: Vec<Weighted>,
}

impl CriteriaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in criteria with weights from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .with(
                Distance {
                    base: config.distance_base,
                },
                config.weights.distance,
            )
            .with(
                Reliability {
                    half_life: config.crash_half_life(),
                },
                config.weights.reliability,
            )
            .with(
                Responsiveness {
                    reference: config.latency_reference(),
                    neutral: config.neutral_responsiveness,
                },
                config.weights.responsiveness,
            )
            .with(CrashAffinity, config.weights.crash_affinity)
    }

    /// Appends a criterion. Negative or non-finite weights count as zero.
    #[must_use]
    pub fn with(mut self, criterion: impl Criterion + 'static, weight: f64) -> Self {
        let weight = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
        self.entries.push(Weighted {
            criterion: Box::new(criterion),
            weight,
        });
        self
    }

    /// Weighted mean of all criteria; zero when the weights sum to zero.
    pub fn total(
        &self,
        spec: &ComponentSpec,
        isolate: &Isolate,
        history: &History,
        now: Timestamp,
    ) -> f64 {
        let mut weighted = 0.0;
        let mut weights = 0.0;
        for entry in &self.entries {
            let score = entry.criterion.score(spec, isolate, history, now);
            let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
            weighted += entry.weight * score;
            weights += entry.weight;
        }
        if weights == 0.0 {
            0.0
        } else {
            weighted / weights
        }
    }

    /// Criterion names in evaluation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.criterion.name()).collect()
    }
}
