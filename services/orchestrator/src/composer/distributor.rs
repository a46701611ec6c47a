//! The distributor: picks an isolate for each pending component.

use std::collections::{BTreeMap, BTreeSet};

use orbit_events::PendingReason;
use orbit_id::{ComponentName, IsolateId};
use orbit_reconcile::Timestamp;
use tracing::debug;

use super::criteria::{CriteriaSet, History};
use crate::catalog::Catalog;
use crate::model::ComponentSpec;
use crate::registry::{Isolate, Registry};

/// Outcome of placing one spec.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Assign {
        component: ComponentName,
        isolate: IsolateId,
        score: f64,
    },
    Pending {
        component: ComponentName,
        reason: PendingReason,
    },
}

impl Decision {
    pub fn component(&self) -> &ComponentName {
        match self {
            Decision::Assign { component, .. } | Decision::Pending { component, .. } => component,
        }
    }
}

/// Read-only view the distributor scores against.
#[derive(Debug, Clone, Copy)]
pub struct FleetView<'a> {
    pub registry: &'a Registry,
    pub catalog: &'a Catalog,
    pub history: &'a History,
}

#[derive(Debug)]
pub struct Distributor {
    criteria: CriteriaSet,
}

impl Distributor {
    pub fn new(criteria: CriteriaSet) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &CriteriaSet {
        &self.criteria
    }

    /// Places one spec against the current fleet.
    ///
    /// Candidates are Running isolates that satisfy the hard constraint,
    /// support the factory, and are not in `excluded`. The highest score
    /// wins; ties go to the lowest isolate id.
    pub fn place_one(
        &self,
        spec: &ComponentSpec,
        fleet: FleetView<'_>,
        excluded: &BTreeSet<IsolateId>,
        now: Timestamp,
    ) -> Decision {
        self.decide(spec, fleet, excluded, now, &BTreeMap::new())
    }

    /// Places `specs` in order, each decision seeing the ones before it.
    ///
    /// Assignments made earlier in the batch are added to a scratch copy of
    /// the chosen isolate's hosted set, so criteria that look at co-located
    /// components score later specs against the planned layout.
    pub fn place<'s>(
        &self,
        specs: impl IntoIterator<Item = &'s ComponentSpec>,
        fleet: FleetView<'_>,
        excluded: &BTreeSet<IsolateId>,
        now: Timestamp,
    ) -> Vec<Decision> {
        let mut planned: BTreeMap<IsolateId, Isolate> = BTreeMap::new();
        let mut decisions = Vec::new();
        for spec in specs {
            let decision = self.decide(spec, fleet, excluded, now, &planned);
            if let Decision::Assign { isolate, .. } = &decision {
                if let Some(scratch) = planned.get_mut(isolate) {
                    scratch.hosted_components.insert(spec.name.clone());
                } else if let Some(current) = fleet.registry.get(isolate) {
                    let mut scratch = current.clone();
                    scratch.hosted_components.insert(spec.name.clone());
                    planned.insert(isolate.clone(), scratch);
                }
            }
            decisions.push(decision);
        }
        decisions
    }

    fn decide(
        &self,
        spec: &ComponentSpec,
        fleet: FleetView<'_>,
        excluded: &BTreeSet<IsolateId>,
        now: Timestamp,
        planned: &BTreeMap<IsolateId, Isolate>,
    ) -> Decision {
        let mut constrained = 0usize;
        let mut compatible = 0usize;
        let mut best: Option<(&IsolateId, f64)> = None;

        // Running isolates come out in id order, so a strict comparison
        // leaves the lowest id in place on ties.
        for isolate in fleet.registry.running() {
            if !spec.constraint.admits(&isolate.id, &isolate.node) {
                continue;
            }
            constrained += 1;
            if !fleet.catalog.supports(&isolate.id, &spec.factory, &spec.kind) {
                continue;
            }
            compatible += 1;
            if excluded.contains(&isolate.id) {
                continue;
            }

            let scored = planned.get(&isolate.id).unwrap_or(isolate);
            let score = self.criteria.total(spec, scored, fleet.history, now);
            debug!(
                component = %spec.name,
                isolate_id = %isolate.id,
                score,
                "Scored candidate"
            );
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((&isolate.id, score));
            }
        }

        match best {
            Some((isolate, score)) => Decision::Assign {
                component: spec.name.clone(),
                isolate: isolate.clone(),
                score,
            },
            None => {
                let reason = if constrained == 0 && spec.constraint.is_explicit() {
                    PendingReason::ConstraintUnsatisfiable
                } else if compatible == 0 {
                    PendingReason::NoCompatibleIsolate
                } else {
                    PendingReason::AllCandidatesExcluded
                };
                Decision::Pending {
                    component: spec.name.clone(),
                    reason,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::criteria::{CrashAffinity, Distance};
    use crate::model::Constraint;
    use orbit_events::IsolateState;

    struct Fleet {
        registry: Registry,
        catalog: Catalog,
        history: History,
    }

    impl Fleet {
        fn new() -> Self {
            Self {
                registry: Registry::new(),
                catalog: Catalog::new(),
                history: History::new(4),
            }
        }

        fn add(&mut self, id: &str, node: &str, factories: &[&str]) {
            let id: IsolateId = id.parse().unwrap();
            let kind = "python".parse().unwrap();
            self.registry
                .upsert(&id, &node.parse().unwrap(), &kind, Timestamp::ZERO);
            self.registry.set_state(&id, IsolateState::Running);
            self.catalog
                .declare(&id, &kind, factories.iter().map(|f| f.parse().unwrap()));
        }

        fn view(&self) -> FleetView<'_> {
            FleetView {
                registry: &self.registry,
                catalog: &self.catalog,
                history: &self.history,
            }
        }
    }

    fn distributor() -> Distributor {
        Distributor::new(
            CriteriaSet::new()
                .with(Distance { base: 0.5 }, 1.0)
                .with(CrashAffinity, 0.5),
        )
    }

    fn spec(name: &str) -> ComponentSpec {
        ComponentSpec::new(
            name.parse().unwrap(),
            "F".parse().unwrap(),
            "python".parse().unwrap(),
        )
    }

    fn assigned_to(decision: &Decision) -> Option<&str> {
        match decision {
            Decision::Assign { isolate, .. } => Some(isolate.as_str()),
            Decision::Pending { .. } => None,
        }
    }

    #[test]
    fn test_tie_breaks_on_lowest_id() {
        let mut fleet = Fleet::new();
        fleet.add("iso-C", "n1", &["F"]);
        fleet.add("iso-A", "n2", &["F"]);
        fleet.add("iso-B", "n3", &["F"]);

        let decision = distributor().place_one(&spec("c1"), fleet.view(), &BTreeSet::new(), Timestamp::ZERO);
        assert_eq!(assigned_to(&decision), Some("iso-A"));
    }

    #[test]
    fn test_preferred_node_wins() {
        let mut fleet = Fleet::new();
        fleet.add("iso-A", "n1", &["F"]);
        fleet.add("iso-B", "n2", &["F"]);

        let decision = distributor().place_one(
            &spec("c1").preferring("n2".parse().unwrap()),
            fleet.view(),
            &BTreeSet::new(),
            Timestamp::ZERO,
        );
        assert_eq!(assigned_to(&decision), Some("iso-B"));
    }

    #[test]
    fn test_constraint_unsatisfiable() {
        let mut fleet = Fleet::new();
        fleet.add("iso-A", "n1", &["F"]);

        let decision = distributor().place_one(
            &spec("c2").with_constraint(Constraint::Isolate("iso-Z".parse().unwrap())),
            fleet.view(),
            &BTreeSet::new(),
            Timestamp::ZERO,
        );
        assert_eq!(
            decision,
            Decision::Pending {
                component: "c2".parse().unwrap(),
                reason: PendingReason::ConstraintUnsatisfiable
            }
        );
    }

    #[test]
    fn test_no_compatible_isolate() {
        let mut fleet = Fleet::new();
        fleet.add("iso-A", "n1", &["G"]);

        let unconstrained =
            distributor().place_one(&spec("c1"), fleet.view(), &BTreeSet::new(), Timestamp::ZERO);
        let on_node = distributor().place_one(
            &spec("c2").with_constraint(Constraint::Node("n1".parse().unwrap())),
            fleet.view(),
            &BTreeSet::new(),
            Timestamp::ZERO,
        );
        for decision in [unconstrained, on_node] {
            assert!(matches!(
                decision,
                Decision::Pending {
                    reason: PendingReason::NoCompatibleIsolate,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_exclusion_applies_to_round() {
        let mut fleet = Fleet::new();
        fleet.add("iso-A", "n1", &["F"]);
        fleet.add("iso-B", "n2", &["F"]);
        let excluded: BTreeSet<IsolateId> = ["iso-A".parse().unwrap()].into();

        let decision = distributor().place_one(&spec("c3"), fleet.view(), &excluded, Timestamp::ZERO);
        assert_eq!(assigned_to(&decision), Some("iso-B"));

        let all: BTreeSet<IsolateId> = ["iso-A".parse().unwrap(), "iso-B".parse().unwrap()].into();
        let decision = distributor().place_one(&spec("c3"), fleet.view(), &all, Timestamp::ZERO);
        assert!(matches!(
            decision,
            Decision::Pending {
                reason: PendingReason::AllCandidatesExcluded,
                ..
            }
        ));
    }

    #[test]
    fn test_batch_keeps_crash_partners_apart() {
        let mut fleet = Fleet::new();
        fleet.add("iso-A", "n1", &["F"]);
        fleet.add("iso-B", "n2", &["F"]);
        let partners: [ComponentName; 2] = ["a".parse().unwrap(), "b".parse().unwrap()];
        fleet.history.record_crash(partners);

        let only_affinity = Distributor::new(CriteriaSet::new().with(CrashAffinity, 1.0));
        let decisions = only_affinity.place(
            [&spec("a"), &spec("b")],
            fleet.view(),
            &BTreeSet::new(),
            Timestamp::ZERO,
        );
        assert_eq!(assigned_to(&decisions[0]), Some("iso-A"));
        assert_eq!(assigned_to(&decisions[1]), Some("iso-B"));

        // The fleet itself is untouched by planning.
        let a = fleet.registry.get(&"iso-A".parse().unwrap()).unwrap();
        assert!(a.hosted_components.is_empty());
    }

    #[test]
    fn test_non_running_isolates_ignored() {
        let mut fleet = Fleet::new();
        fleet.add("iso-A", "n1", &["F"]);
        fleet
            .registry
            .set_state(&"iso-A".parse().unwrap(), IsolateState::Lost);

        let decisions = distributor().place(
            [&spec("c1"), &spec("c2")],
            fleet.view(),
            &BTreeSet::new(),
            Timestamp::ZERO,
        );
        assert!(decisions
            .iter()
            .all(|d| matches!(d, Decision::Pending { reason: PendingReason::NoCompatibleIsolate, .. })));
        assert_eq!(decisions[1].component().as_str(), "c2");
    }
}
