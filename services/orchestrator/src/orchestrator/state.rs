//! Fleet state and the handlers that mutate it.
//!
//! Everything here runs inside a single orchestrator step. Handlers may push
//! commands to the outbox, notifications for subscribers, and derived events;
//! the caller discards all three if the step is rolled back.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use orbit_events::{
    FleetEvent, IsolateState, IsolateStateChangedPayload, NodeReachabilityChangedPayload,
    PendingReason, PlacementChangedPayload, PlacementStatus,
};
use orbit_id::{CommandId, ComponentName, CompositionName, IsolateId, NodeName};
use orbit_reconcile::Timestamp;
use tracing::{debug, info, warn};

use super::events::{AckOutcome, Event, Registration};
use crate::catalog::Catalog;
use crate::composer::{Decision, Distributor, FleetView, History};
use crate::error::{CompositionError, InvariantViolation};
use crate::forker::{LivenessTracker, RestartOutcome, RestartSupervisor};
use crate::model::{validate_specs, ComponentSpec, Composition};
use crate::placement::PlacementTable;
use crate::registry::{Isolate, Registry};
use crate::transport::{Command, PlacementCommand, RemovalCommand};

/// Immutable collaborators of a step.
#[derive(Debug)]
pub(crate) struct Rules {
    pub distributor: Distributor,
    pub liveness: LivenessTracker,
    pub command_timeout: Duration,
}

/// A placement command awaiting its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outstanding {
    pub component: ComponentName,
    pub isolate: IsolateId,
    pub issued_at: Timestamp,
    pub deadline: Duration,
}

/// How a placement command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Accepted,
    Rejected(String),
    TimedOut,
}

/// All state owned by the orchestrator loop.
#[derive(Debug, Clone)]
pub struct FleetState {
    pub(crate) registry: Registry,
    pub(crate) catalog: Catalog,
    pub(crate) table: PlacementTable,
    pub(crate) compositions: BTreeSet<CompositionName>,
    pub(crate) outstanding: BTreeMap<CommandId, Outstanding>,
    pub(crate) history: History,
    pub(crate) restarts: RestartSupervisor,
    pub(crate) outbox: Vec<Command>,
    pub(crate) notifications: Vec<FleetEvent>,
}

impl FleetState {
    pub(crate) fn new(history: History, restarts: RestartSupervisor) -> Self {
        Self {
            registry: Registry::new(),
            catalog: Catalog::new(),
            table: PlacementTable::new(),
            compositions: BTreeSet::new(),
            outstanding: BTreeMap::new(),
            history,
            restarts,
            outbox: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn table(&self) -> &PlacementTable {
        &self.table
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn restarts(&self) -> &RestartSupervisor {
        &self.restarts
    }

    pub fn outstanding(&self) -> &BTreeMap<CommandId, Outstanding> {
        &self.outstanding
    }

    pub fn is_loaded(&self, composition: &CompositionName) -> bool {
        self.compositions.contains(composition)
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Checks every table invariant against the registry and catalog.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut hosted: BTreeMap<&IsolateId, BTreeSet<&ComponentName>> = BTreeMap::new();
        for entry in self.table.iter() {
            let (true, Some(id)) = (entry.is_assigned(), entry.isolate.as_ref()) else {
                continue;
            };
            hosted.entry(id).or_default().insert(&entry.spec.name);
            let component = &entry.spec.name;
            let Some(isolate) = self.registry.get(id) else {
                return Err(InvariantViolation::UnknownIsolate {
                    component: component.clone(),
                    isolate: id.clone(),
                });
            };
            if !isolate.is_running() {
                return Err(InvariantViolation::NotRunning {
                    component: component.clone(),
                    isolate: id.clone(),
                    state: isolate.state,
                });
            }
            if !self.catalog.supports(id, &entry.spec.factory, &entry.spec.kind) {
                return Err(InvariantViolation::Unsupported {
                    component: component.clone(),
                    isolate: id.clone(),
                });
            }
            if !entry.spec.constraint.admits(id, &isolate.node) {
                return Err(InvariantViolation::ConstraintBreached {
                    component: component.clone(),
                    isolate: id.clone(),
                });
            }
        }

        for isolate in self.registry.isolates() {
            let matches = match hosted.get(&isolate.id) {
                Some(expected) => isolate.hosted_components.iter().eq(expected.iter().copied()),
                None => isolate.hosted_components.is_empty(),
            };
            if !matches {
                return Err(InvariantViolation::HostedMismatch(isolate.id.clone()));
            }
        }
        Ok(())
    }

    /// Whether `event` may move, add or drop a placement entry.
    ///
    /// Events that answer false only touch heartbeat times, latency samples
    /// or the in-flight command marker, none of which the invariants read.
    pub(crate) fn can_change_placement(&self, rules: &Rules, event: &Event, now: Timestamp) -> bool {
        match event {
            Event::Heartbeat { .. } => false,
            Event::Sweep => rules.liveness.any_expired(&self.registry, now),
            Event::Rescan => self.table.iter().any(|e| e.is_unplaced()),
            Event::Shutdown { isolate } => self
                .registry
                .get(isolate)
                .is_some_and(|i| i.state != IsolateState::Stopped),
            Event::UnloadComposition(name) => self.compositions.contains(name),
            Event::PlacementAck {
                outcome: AckOutcome::Accepted,
                ..
            } => false,
            Event::PlacementAck { command, .. } | Event::PlacementTimeout { command } => {
                self.outstanding.contains_key(command)
            }
            _ => true,
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    pub(crate) fn apply(
        &mut self,
        rules: &Rules,
        event: Event,
        now: Timestamp,
        derived: &mut Vec<Event>,
    ) -> Result<(), InvariantViolation> {
        match event {
            Event::Register(registration) => self.register(rules, registration, now, derived),
            Event::Heartbeat { isolate, at } => {
                rules.liveness.heartbeat(&mut self.registry, &isolate, at);
                Ok(())
            }
            Event::Shutdown { isolate } => self.shutdown(rules, &isolate, now),
            Event::IsolateJoined { isolate } => self.isolate_joined(rules, &isolate, now),
            Event::IsolateLost { isolate, displaced } => {
                self.isolate_lost(rules, &isolate, &displaced, now)
            }
            Event::LoadComposition(composition) => self.load_composition(rules, composition, now),
            Event::UnloadComposition(name) => {
                self.unload_composition(&name);
                Ok(())
            }
            Event::ComponentsAdded { composition, specs } => {
                self.components_added(rules, &composition, specs, now)
            }
            Event::ComponentsRemoved { composition, names } => {
                self.components_removed(&composition, &names);
                Ok(())
            }
            Event::PlacementAck { command, outcome } => {
                let resolution = match outcome {
                    AckOutcome::Accepted => Resolution::Accepted,
                    AckOutcome::Rejected(reason) => Resolution::Rejected(reason),
                };
                self.resolve(rules, &command, resolution, now)
            }
            Event::PlacementTimeout { command } => {
                self.resolve(rules, &command, Resolution::TimedOut, now)
            }
            Event::Sweep => {
                self.sweep(rules, now, derived);
                Ok(())
            }
            Event::Rescan => {
                let unplaced = self.table.unplaced();
                self.place_all(rules, &unplaced, &BTreeSet::new(), now)
            }
        }
    }

    // =========================================================================
    // Isolate lifecycle
    // =========================================================================

    fn register(
        &mut self,
        rules: &Rules,
        registration: Registration,
        now: Timestamp,
        derived: &mut Vec<Event>,
    ) -> Result<(), InvariantViolation> {
        let Registration {
            isolate: id,
            node,
            kind,
            factories,
            at,
        } = registration;

        let registered = rules
            .liveness
            .register(&mut self.registry, &id, &node, &kind, at);
        self.catalog.declare(&id, &kind, factories);

        // The table is authoritative: keep what still fits, release the rest.
        let misfits: Vec<ComponentName> = self
            .table
            .assigned_to(&id)
            .into_iter()
            .filter(|name| {
                self.table.get(name).is_some_and(|e| {
                    !self.catalog.supports(&id, &e.spec.factory, &e.spec.kind)
                        || !e.spec.constraint.admits(&id, &node)
                })
            })
            .collect();
        for name in &misfits {
            self.release(name, PendingReason::NoCompatibleIsolate);
        }

        self.registry.set_state(&id, IsolateState::Running);
        let hosted: BTreeSet<ComponentName> = self.table.assigned_to(&id).into_iter().collect();
        if let Some(isolate) = self.registry.get_mut(&id) {
            isolate.hosted_components = hosted;
        }
        self.restarts.on_rejoined(&id, now);

        info!(
            isolate_id = %id,
            node = %node,
            kind = %kind,
            previous = ?registered.previous,
            released = misfits.len(),
            "Isolate registered"
        );
        self.notify_isolate(&id, &node, registered.previous, IsolateState::Running);
        self.refresh_node(&node);
        if let Some(old) = registered.moved_from {
            self.refresh_node(&old);
        }

        derived.push(Event::IsolateJoined { isolate: id });
        Ok(())
    }

    fn shutdown(
        &mut self,
        rules: &Rules,
        id: &IsolateId,
        now: Timestamp,
    ) -> Result<(), InvariantViolation> {
        let Some(isolate) = self.registry.get(id) else {
            debug!(isolate_id = %id, "Shutdown of unknown isolate ignored");
            return Ok(());
        };
        if isolate.state == IsolateState::Stopped {
            debug!(isolate_id = %id, "Isolate already stopped");
            return Ok(());
        }
        let previous = isolate.state;
        let node = isolate.node.clone();

        self.registry.set_state(id, IsolateState::Stopped);
        self.catalog.clear(id);
        self.restarts.on_stopped(id);
        let displaced = self.displace(id, PendingReason::IsolateStopped);

        info!(
            isolate_id = %id,
            node = %node,
            displaced = displaced.len(),
            "Isolate stopped"
        );
        self.notify_isolate(id, &node, Some(previous), IsolateState::Stopped);
        self.refresh_node(&node);

        self.place_all(rules, &displaced, &BTreeSet::new(), now)
    }

    fn sweep(&mut self, rules: &Rules, now: Timestamp, derived: &mut Vec<Event>) {
        for id in rules.liveness.sweep(&self.registry, now) {
            rules.liveness.mark_lost(&mut self.registry, &id, now);
            let displaced = self.displace(&id, PendingReason::IsolateLost);
            self.history.record_crash(displaced.iter().cloned());

            let Some(isolate) = self.registry.get(&id) else {
                continue;
            };
            let node = isolate.node.clone();
            warn!(
                isolate_id = %id,
                node = %node,
                last_heartbeat = %isolate.last_heartbeat,
                displaced = displaced.len(),
                "Isolate lost: heartbeat timed out"
            );
            self.notify_isolate(&id, &node, Some(IsolateState::Running), IsolateState::Lost);
            self.refresh_node(&node);

            derived.push(Event::IsolateLost {
                isolate: id,
                displaced,
            });
        }
    }

    fn isolate_lost(
        &mut self,
        rules: &Rules,
        id: &IsolateId,
        displaced: &[ComponentName],
        now: Timestamp,
    ) -> Result<(), InvariantViolation> {
        if let Some(isolate) = self.registry.get(id) {
            if isolate.state == IsolateState::Lost {
                if let RestartOutcome::Requested(request) = self.restarts.on_lost(isolate, now) {
                    self.outbox.push(Command::Restart(request));
                }
            }
        }
        self.place_all(rules, displaced, &BTreeSet::new(), now)
    }

    fn isolate_joined(
        &mut self,
        rules: &Rules,
        id: &IsolateId,
        now: Timestamp,
    ) -> Result<(), InvariantViolation> {
        if !self.registry.get(id).is_some_and(Isolate::is_running) {
            debug!(isolate_id = %id, "Joined isolate no longer running");
            return Ok(());
        }
        let unplaced = self.table.unplaced();
        self.place_all(rules, &unplaced, &BTreeSet::new(), now)
    }

    // =========================================================================
    // Compositions
    // =========================================================================

    fn load_composition(
        &mut self,
        rules: &Rules,
        composition: Composition,
        now: Timestamp,
    ) -> Result<(), InvariantViolation> {
        let name = composition.name.clone();
        let specs = match composition.flatten() {
            Ok(specs) => specs,
            Err(e) => {
                warn!(composition = %name, error = %e, "Composition rejected");
                return Ok(());
            }
        };
        if let Err(e) = self.check_ownership(&name, &specs) {
            warn!(composition = %name, error = %e, "Composition rejected");
            return Ok(());
        }

        let reload = !self.compositions.insert(name.clone());
        let declared: BTreeSet<&ComponentName> = specs.iter().map(|s| &s.name).collect();
        let mut removed = 0usize;
        for existing in self.table.components_of(&name) {
            if !declared.contains(&existing) {
                self.remove_component(&existing);
                removed += 1;
            }
        }

        let mut to_place = Vec::with_capacity(specs.len());
        let mut kept = 0usize;
        for spec in specs {
            match self.table.get(&spec.name) {
                Some(entry) if entry.spec == spec => {
                    if entry.is_unplaced() {
                        to_place.push(spec.name.clone());
                    }
                    kept += 1;
                }
                Some(_) => {
                    self.retract(&spec.name);
                    to_place.push(spec.name.clone());
                    self.table.insert(&name, spec);
                }
                None => {
                    to_place.push(spec.name.clone());
                    self.table.insert(&name, spec);
                }
            }
        }

        info!(
            composition = %name,
            reload,
            kept,
            removed,
            placing = to_place.len(),
            "Composition loaded"
        );
        self.place_all(rules, &to_place, &BTreeSet::new(), now)
    }

    fn unload_composition(&mut self, name: &CompositionName) {
        if !self.compositions.remove(name) {
            debug!(composition = %name, "Unload of unknown composition ignored");
            return;
        }
        let components = self.table.components_of(name);
        for component in &components {
            self.remove_component(component);
        }
        info!(composition = %name, removed = components.len(), "Composition unloaded");
    }

    fn components_added(
        &mut self,
        rules: &Rules,
        composition: &CompositionName,
        specs: Vec<ComponentSpec>,
        now: Timestamp,
    ) -> Result<(), InvariantViolation> {
        if !self.compositions.contains(composition) {
            let e = CompositionError::UnknownComposition(composition.clone());
            warn!(composition = %composition, error = %e, "Components rejected");
            return Ok(());
        }
        let known: BTreeSet<ComponentName> = self
            .table
            .components_of(composition)
            .into_iter()
            .collect();
        let checked = self
            .check_ownership(composition, &specs)
            .and_then(|()| validate_specs(&specs, &known));
        if let Err(e) = checked {
            warn!(composition = %composition, error = %e, "Components rejected");
            return Ok(());
        }

        let names: Vec<ComponentName> = specs.iter().map(|s| s.name.clone()).collect();
        for spec in specs {
            self.table.insert(composition, spec);
        }
        info!(composition = %composition, added = names.len(), "Components added");
        self.place_all(rules, &names, &BTreeSet::new(), now)
    }

    fn components_removed(&mut self, composition: &CompositionName, names: &[ComponentName]) {
        for name in names {
            let owned = self
                .table
                .get(name)
                .is_some_and(|e| e.composition == *composition);
            if owned {
                self.remove_component(name);
                info!(composition = %composition, component = %name, "Component removed");
            } else {
                debug!(composition = %composition, component = %name, "Removal of unknown component ignored");
            }
        }
    }

    /// Rejects specs whose names belong to another composition.
    fn check_ownership(
        &self,
        composition: &CompositionName,
        specs: &[ComponentSpec],
    ) -> Result<(), CompositionError> {
        for spec in specs {
            if let Some(entry) = self.table.get(&spec.name) {
                if entry.composition != *composition {
                    return Err(CompositionError::OwnedElsewhere {
                        component: spec.name.clone(),
                        owner: entry.composition.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Command resolution
    // =========================================================================

    fn resolve(
        &mut self,
        rules: &Rules,
        command: &CommandId,
        resolution: Resolution,
        now: Timestamp,
    ) -> Result<(), InvariantViolation> {
        let Some(outstanding) = self.outstanding.remove(command) else {
            debug!(command_id = %command, "Command already resolved");
            return Ok(());
        };
        let Outstanding {
            component,
            isolate,
            issued_at,
            deadline,
        } = outstanding;

        let reason = match resolution {
            Resolution::Accepted => {
                self.history
                    .record_latency(&isolate, now.saturating_since(issued_at));
                if self.table.confirm(&component, command) {
                    debug!(command_id = %command, component = %component, isolate_id = %isolate, "Placement acknowledged");
                }
                return Ok(());
            }
            Resolution::Rejected(detail) => {
                warn!(
                    command_id = %command,
                    component = %component,
                    isolate_id = %isolate,
                    error = %detail,
                    "Placement command failed"
                );
                PendingReason::CommandFailed
            }
            Resolution::TimedOut => {
                warn!(
                    command_id = %command,
                    component = %component,
                    isolate_id = %isolate,
                    deadline_ms = deadline.as_millis() as u64,
                    "Placement command timed out"
                );
                PendingReason::CommandTimedOut
            }
        };

        self.history.record_latency(&isolate, deadline);

        let current = self
            .table
            .get(&component)
            .is_some_and(|e| e.command.as_ref() == Some(command));
        if !current {
            debug!(command_id = %command, component = %component, "Stale command failure ignored");
            return Ok(());
        }

        self.release(&component, reason);
        let excluded = BTreeSet::from([isolate]);
        self.place_all(rules, std::slice::from_ref(&component), &excluded, now)?;

        if self.table.mark_failed(&component, reason) {
            warn!(component = %component, reason = %reason, "No other candidate, placement failed");
            self.notify_placement(&component, None);
        }
        Ok(())
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Places each unplaced component of `names`, in declaration order.
    ///
    /// The distributor plans the whole batch sequentially, so later specs
    /// see earlier assignments; the decisions are then applied in order.
    fn place_all(
        &mut self,
        rules: &Rules,
        names: &[ComponentName],
        excluded: &BTreeSet<IsolateId>,
        now: Timestamp,
    ) -> Result<(), InvariantViolation> {
        let specs: Vec<ComponentSpec> = self
            .table
            .in_declaration_order(names)
            .iter()
            .filter_map(|name| self.table.get(name))
            .filter(|entry| entry.is_unplaced())
            .map(|entry| entry.spec.clone())
            .collect();
        if specs.is_empty() {
            return Ok(());
        }

        let fleet = FleetView {
            registry: &self.registry,
            catalog: &self.catalog,
            history: &self.history,
        };
        let decisions = rules.distributor.place(&specs, fleet, excluded, now);

        for (spec, decision) in specs.iter().zip(decisions) {
            match decision {
                Decision::Assign { isolate, score, .. } => {
                    self.assign(rules, spec, &isolate, score, now)?;
                }
                Decision::Pending { reason, .. } => {
                    if self.table.set_pending_reason(&spec.name, reason) {
                        debug!(component = %spec.name, reason = %reason, "Component pending");
                        self.notify_placement(&spec.name, None);
                    }
                }
            }
        }
        Ok(())
    }

    fn assign(
        &mut self,
        rules: &Rules,
        spec: &ComponentSpec,
        id: &IsolateId,
        score: f64,
        now: Timestamp,
    ) -> Result<(), InvariantViolation> {
        let command = CommandId::new();
        self.table.assign(&spec.name, id, score, command)?;

        let Some(isolate) = self.registry.get_mut(id) else {
            return Err(InvariantViolation::UnknownIsolate {
                component: spec.name.clone(),
                isolate: id.clone(),
            });
        };
        isolate.hosted_components.insert(spec.name.clone());
        let node = isolate.node.clone();

        self.outstanding.insert(
            command,
            Outstanding {
                component: spec.name.clone(),
                isolate: id.clone(),
                issued_at: now,
                deadline: rules.command_timeout,
            },
        );
        self.outbox.push(Command::Place(PlacementCommand::new(
            command,
            id.clone(),
            node,
            spec,
            rules.command_timeout,
        )));

        info!(component = %spec.name, isolate_id = %id, score, "Component assigned");
        self.notify_placement(&spec.name, None);
        Ok(())
    }

    /// Moves every component off `id`, returning them in declaration order.
    fn displace(&mut self, id: &IsolateId, reason: PendingReason) -> Vec<ComponentName> {
        let names = self.table.assigned_to(id);
        for name in &names {
            self.release(name, reason);
        }
        names
    }

    /// Unassigns `name` back to Pending and updates the hosting isolate.
    fn release(&mut self, name: &ComponentName, reason: PendingReason) {
        let Some(previous) = self.table.unassign(name, PlacementStatus::Pending, reason) else {
            return;
        };
        if let Some(isolate) = self.registry.get_mut(&previous) {
            isolate.hosted_components.remove(name);
        }
        self.notify_placement(name, Some(previous));
    }

    /// Releases `name` and tells its isolate to drop it.
    fn retract(&mut self, name: &ComponentName) {
        let Some(previous) = self
            .table
            .get(name)
            .filter(|e| e.is_assigned())
            .and_then(|e| e.isolate.clone())
        else {
            return;
        };
        self.release(name, PendingReason::AwaitingPlacement);
        self.outbox.push(Command::Remove(RemovalCommand {
            isolate: previous,
            component: name.clone(),
        }));
    }

    fn remove_component(&mut self, name: &ComponentName) {
        self.retract(name);
        self.table.remove(name);
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    fn notify_placement(&mut self, name: &ComponentName, old_isolate: Option<IsolateId>) {
        let Some(entry) = self.table.get(name) else {
            return;
        };
        self.notifications
            .push(FleetEvent::PlacementChanged(PlacementChangedPayload {
                component: name.clone(),
                composition: entry.composition.clone(),
                old_isolate,
                new_isolate: entry.isolate.clone(),
                status: entry.status,
                score: entry.score,
                reason: entry.reason,
            }));
    }

    fn notify_isolate(
        &mut self,
        id: &IsolateId,
        node: &NodeName,
        old_state: Option<IsolateState>,
        new_state: IsolateState,
    ) {
        self.notifications
            .push(FleetEvent::IsolateStateChanged(IsolateStateChangedPayload {
                isolate_id: id.clone(),
                node: node.clone(),
                old_state,
                new_state,
            }));
    }

    fn refresh_node(&mut self, node: &NodeName) {
        if let Some(reachable) = self.registry.refresh_reachability(node) {
            info!(node = %node, reachable, "Node reachability changed");
            self.notifications
                .push(FleetEvent::NodeReachabilityChanged(
                    NodeReachabilityChangedPayload {
                        node: node.clone(),
                        reachable,
                    },
                ));
        }
    }
}
