//! Placement table: the authoritative component -> isolate map.
//!
//! Only the orchestrator loop mutates the table. Entries are created when a
//! composition is loaded and removed when it is unloaded.

use std::collections::BTreeMap;

use orbit_events::{PendingReason, PlacementStatus};
use orbit_id::{CommandId, ComponentName, CompositionName, IsolateId};

use crate::error::InvariantViolation;
use crate::model::ComponentSpec;

/// Placement state of one declared component.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementEntry {
    pub spec: ComponentSpec,
    pub composition: CompositionName,
    /// Declaration order across all loaded compositions.
    pub order: u64,
    pub status: PlacementStatus,
    pub isolate: Option<IsolateId>,
    /// Score of the winning candidate, while Assigned.
    pub score: Option<f64>,
    pub reason: Option<PendingReason>,
    /// Placement command in flight for the current assignment.
    pub command: Option<CommandId>,
}

impl PlacementEntry {
    pub fn is_assigned(&self) -> bool {
        self.status == PlacementStatus::Assigned
    }

    /// Pending or Failed: eligible for every retry path.
    pub fn is_unplaced(&self) -> bool {
        !self.is_assigned()
    }

    /// Current reason, defaulting for entries never considered.
    pub fn reason_or_default(&self) -> PendingReason {
        self.reason.unwrap_or(PendingReason::AwaitingPlacement)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlacementTable {
    entries: BTreeMap<ComponentName, PlacementEntry>,
    next_order: u64,
}

impl PlacementTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a Pending entry for `spec`, or replaces the spec of an existing
    /// entry (keeping its declaration order) and resets it to Pending.
    pub fn insert(&mut self, composition: &CompositionName, spec: ComponentSpec) {
        let order = match self.entries.get(&spec.name) {
            Some(existing) => existing.order,
            None => {
                let order = self.next_order;
                self.next_order += 1;
                order
            }
        };
        self.entries.insert(
            spec.name.clone(),
            PlacementEntry {
                spec,
                composition: composition.clone(),
                order,
                status: PlacementStatus::Pending,
                isolate: None,
                score: None,
                reason: Some(PendingReason::AwaitingPlacement),
                command: None,
            },
        );
    }

    pub fn remove(&mut self, name: &ComponentName) -> Option<PlacementEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &ComponentName) -> Option<&PlacementEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &ComponentName) -> bool {
        self.entries.contains_key(name)
    }

    /// Marks `name` Assigned to `isolate`.
    ///
    /// Assigning an entry that is already Assigned is rejected: a component
    /// must be unassigned before it can move.
    pub fn assign(
        &mut self,
        name: &ComponentName,
        isolate: &IsolateId,
        score: f64,
        command: CommandId,
    ) -> Result<(), InvariantViolation> {
        let Some(entry) = self.entries.get_mut(name) else {
            return Ok(());
        };
        if let (PlacementStatus::Assigned, Some(current)) = (entry.status, &entry.isolate) {
            return Err(InvariantViolation::AlreadyAssigned {
                component: name.clone(),
                isolate: current.clone(),
            });
        }
        entry.status = PlacementStatus::Assigned;
        entry.isolate = Some(isolate.clone());
        entry.score = Some(score);
        entry.reason = None;
        entry.command = Some(command);
        Ok(())
    }

    /// Moves `name` out of Assigned, returning the isolate it was on.
    pub fn unassign(
        &mut self,
        name: &ComponentName,
        status: PlacementStatus,
        reason: PendingReason,
    ) -> Option<IsolateId> {
        let entry = self.entries.get_mut(name)?;
        entry.status = status;
        entry.score = None;
        entry.reason = Some(reason);
        entry.command = None;
        entry.isolate.take()
    }

    /// Updates the diagnostic reason of an unplaced entry.
    ///
    /// Returns true if the entry changed. A Failed entry keeps its command
    /// failure unless the fleet can no longer host it at all, in which case
    /// it goes back to Pending with that reason.
    pub fn set_pending_reason(&mut self, name: &ComponentName, reason: PendingReason) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.status == PlacementStatus::Pending => {
                let changed = entry.reason != Some(reason);
                entry.reason = Some(reason);
                changed
            }
            Some(entry)
                if entry.status == PlacementStatus::Failed && reason.is_structural() =>
            {
                entry.status = PlacementStatus::Pending;
                entry.reason = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// Readonly pass over every entry, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &PlacementEntry> {
        self.entries.values()
    }

    /// Marks an unplaced entry Failed.
    pub fn mark_failed(&mut self, name: &ComponentName, reason: PendingReason) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.is_unplaced() => {
                entry.status = PlacementStatus::Failed;
                entry.reason = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// Clears the in-flight command of an acknowledged assignment.
    pub fn confirm(&mut self, name: &ComponentName, command: &CommandId) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.command.as_ref() == Some(command) => {
                entry.command = None;
                true
            }
            _ => false,
        }
    }

    /// Components Assigned to `isolate`, in declaration order.
    pub fn assigned_to(&self, isolate: &IsolateId) -> Vec<ComponentName> {
        self.names_in_order(|e| e.is_assigned() && e.isolate.as_ref() == Some(isolate))
    }

    /// Pending and Failed components, in declaration order.
    pub fn unplaced(&self) -> Vec<ComponentName> {
        self.names_in_order(PlacementEntry::is_unplaced)
    }

    /// Components owned by `composition`, in declaration order.
    pub fn components_of(&self, composition: &CompositionName) -> Vec<ComponentName> {
        self.names_in_order(|e| e.composition == *composition)
    }

    /// Sorts `names` into declaration order, dropping unknown ones.
    pub fn in_declaration_order(&self, names: &[ComponentName]) -> Vec<ComponentName> {
        let mut found: Vec<&PlacementEntry> =
            names.iter().filter_map(|n| self.entries.get(n)).collect();
        found.sort_by_key(|e| e.order);
        found.dedup_by_key(|e| e.order);
        found.into_iter().map(|e| e.spec.name.clone()).collect()
    }

    /// All entries in declaration order.
    pub fn entries(&self) -> Vec<&PlacementEntry> {
        let mut all: Vec<&PlacementEntry> = self.entries.values().collect();
        all.sort_by_key(|e| e.order);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn names_in_order(&self, pred: impl Fn(&PlacementEntry) -> bool) -> Vec<ComponentName> {
        let mut matching: Vec<&PlacementEntry> =
            self.entries.values().filter(|e| pred(e)).collect();
        matching.sort_by_key(|e| e.order);
        matching.into_iter().map(|e| e.spec.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ComponentSpec {
        ComponentSpec::new(
            name.parse().unwrap(),
            "F".parse().unwrap(),
            "python".parse().unwrap(),
        )
    }

    fn table() -> PlacementTable {
        let app: CompositionName = "app".parse().unwrap();
        let mut table = PlacementTable::new();
        for name in ["zeta", "alpha", "mid"] {
            table.insert(&app, spec(name));
        }
        table
    }

    #[test]
    fn test_insert_keeps_declaration_order() {
        let names: Vec<String> = table().unplaced().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_reinsert_keeps_order_and_resets() {
        let mut table = table();
        let zeta: ComponentName = "zeta".parse().unwrap();
        table
            .assign(&zeta, &"iso-A".parse().unwrap(), 1.0, CommandId::new())
            .unwrap();

        table.insert(&"app".parse().unwrap(), spec("zeta"));
        let entry = table.get(&zeta).unwrap();
        assert_eq!(entry.order, 0);
        assert_eq!(entry.status, PlacementStatus::Pending);
        assert!(entry.isolate.is_none());
    }

    #[test]
    fn test_double_assign_rejected() {
        let mut table = table();
        let alpha: ComponentName = "alpha".parse().unwrap();
        table
            .assign(&alpha, &"iso-A".parse().unwrap(), 1.0, CommandId::new())
            .unwrap();
        let err = table
            .assign(&alpha, &"iso-B".parse().unwrap(), 1.0, CommandId::new())
            .unwrap_err();
        assert!(matches!(err, InvariantViolation::AlreadyAssigned { .. }));
        assert_eq!(
            table.get(&alpha).unwrap().isolate,
            Some("iso-A".parse().unwrap())
        );
    }

    #[test]
    fn test_unassign_and_assigned_to() {
        let mut table = table();
        let iso: IsolateId = "iso-A".parse().unwrap();
        for name in ["mid", "zeta"] {
            table
                .assign(&name.parse().unwrap(), &iso, 0.5, CommandId::new())
                .unwrap();
        }
        let hosted: Vec<String> = table.assigned_to(&iso).iter().map(|n| n.to_string()).collect();
        assert_eq!(hosted, vec!["zeta", "mid"]);

        let previous = table.unassign(
            &"mid".parse().unwrap(),
            PlacementStatus::Pending,
            PendingReason::IsolateLost,
        );
        assert_eq!(previous, Some(iso.clone()));
        assert_eq!(table.assigned_to(&iso).len(), 1);
    }

    #[test]
    fn test_failed_keeps_reason() {
        let mut table = table();
        let mid: ComponentName = "mid".parse().unwrap();
        table.unassign(&mid, PlacementStatus::Failed, PendingReason::CommandTimedOut);
        assert!(!table.set_pending_reason(&mid, PendingReason::AllCandidatesExcluded));
        assert_eq!(
            table.get(&mid).unwrap().reason,
            Some(PendingReason::CommandTimedOut)
        );
    }

    #[test]
    fn test_failed_reopens_when_fleet_cannot_host() {
        let mut table = table();
        let mid: ComponentName = "mid".parse().unwrap();
        table.unassign(&mid, PlacementStatus::Failed, PendingReason::CommandTimedOut);

        assert!(table.set_pending_reason(&mid, PendingReason::ConstraintUnsatisfiable));
        let entry = table.get(&mid).unwrap();
        assert_eq!(entry.status, PlacementStatus::Pending);
        assert_eq!(entry.reason, Some(PendingReason::ConstraintUnsatisfiable));
        assert!(!table.set_pending_reason(&mid, PendingReason::ConstraintUnsatisfiable));
    }

    #[test]
    fn test_confirm_requires_matching_command() {
        let mut table = table();
        let alpha: ComponentName = "alpha".parse().unwrap();
        let cmd = CommandId::new();
        table.assign(&alpha, &"iso-A".parse().unwrap(), 1.0, cmd).unwrap();
        assert!(!table.confirm(&alpha, &CommandId::new()));
        assert!(table.confirm(&alpha, &cmd));
        assert!(!table.confirm(&alpha, &cmd));
    }
}
