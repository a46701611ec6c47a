//! Orchestrator worker: the tokio task that owns the loop.
//!
//! All input arrives on one mpsc channel. Each turn the worker moves ready
//! messages into the priority queue and processes at most [`TURN_BUDGET`]
//! events, dispatching commands on spawned tasks and broadcasting
//! notifications as it goes, then publishes one snapshot. Timer ticks are
//! polled ahead of the inbox so sweeps and rescans run under sustained
//! traffic. Placement outcomes come back through the same channel as
//! `PlacementAck` or `PlacementTimeout`.

use std::sync::Arc;
use std::time::Duration;

use orbit_events::{EventEnvelope, FleetEvent};
use orbit_id::{ComponentName, CompositionName, EventId, FactoryName, IsolateId, NodeName, RuntimeKind};
use orbit_reconcile::Timestamp;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::events::{AckOutcome, Event, Registration};
use super::Orchestrator;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::model::{ComponentSpec, Composition};
use crate::snapshot::{FleetSnapshot, IsolateView, NodeView, PendingComponent, PlacementView};
use crate::transport::{Command, PlacementCommand, Transport};

/// Events processed per worker turn before timers are polled again.
pub const TURN_BUDGET: usize = 256;

/// Monotonic millisecond clock shared by the worker and its handles.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        let ms = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        Timestamp::from_millis(ms)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the worker, returning a handle and the task.
///
/// The worker runs until `shutdown` flips to true.
pub fn start(
    config: &Config,
    transport: Arc<dyn Transport>,
    shutdown: watch::Receiver<bool>,
) -> (OrchestratorHandle, JoinHandle<()>) {
    let clock = Clock::new();
    let (tx, rx) = mpsc::channel(config.mailbox_size);
    let (snapshot_tx, snapshot_rx) = watch::channel(FleetSnapshot::default());
    let (events_tx, _) = broadcast::channel(config.event_buffer);

    let worker = OrchestratorWorker {
        orchestrator: Orchestrator::new(config),
        transport,
        clock,
        inbox: rx,
        outbox: tx.clone(),
        snapshot_tx,
        events_tx: events_tx.clone(),
        next_event_id: EventId::new(1),
        sweep_interval: config.sweep_interval(),
        rescan_interval: config.rescan_interval(),
    };
    let task = tokio::spawn(worker.run(shutdown));

    let handle = OrchestratorHandle {
        tx,
        snapshot_rx,
        events_tx,
        clock,
    };
    (handle, task)
}

struct OrchestratorWorker {
    orchestrator: Orchestrator,
    transport: Arc<dyn Transport>,
    clock: Clock,
    inbox: mpsc::Receiver<Event>,
    /// Sender used by dispatch tasks to report outcomes.
    outbox: mpsc::Sender<Event>,
    snapshot_tx: watch::Sender<FleetSnapshot>,
    events_tx: broadcast::Sender<EventEnvelope<FleetEvent>>,
    next_event_id: EventId,
    sweep_interval: Duration,
    rescan_interval: Duration,
}

impl OrchestratorWorker {
    #[instrument(skip(self, shutdown))]
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            rescan_interval_ms = self.rescan_interval.as_millis() as u64,
            "Starting orchestrator worker"
        );

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rescan = tokio::time::interval(self.rescan_interval);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Don't immediately tick on startup - wait for first interval
        sweep.tick().await;
        rescan.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Orchestrator worker shutting down");
                        break;
                    }
                }
                _ = sweep.tick() => self.orchestrator.submit(Event::Sweep),
                _ = rescan.tick() => self.orchestrator.submit(Event::Rescan),
                message = self.inbox.recv() => {
                    match message {
                        Some(event) => self.orchestrator.submit(event),
                        None => {
                            info!("Inbound channel closed, stopping worker");
                            break;
                        }
                    }
                }
                // Leftovers from a turn that ran out of budget.
                () = std::future::ready(()), if self.orchestrator.queued() > 0 => {}
            }

            self.drain(TURN_BUDGET);
        }
    }

    /// Processes up to `budget` queued events, pulling in newly arrived
    /// messages between events so priorities apply across both.
    ///
    /// Returns how many events ran. Whatever is left stays queued or in the
    /// channel for the next turn.
    fn drain(&mut self, budget: usize) -> usize {
        let mut processed = 0;
        let mut pulled = 0;
        while processed < budget {
            while pulled < budget {
                let Ok(event) = self.inbox.try_recv() else {
                    break;
                };
                self.orchestrator.submit(event);
                pulled += 1;
            }
            let now = self.clock.now();
            if self.orchestrator.process_next(now).is_none() {
                break;
            }
            processed += 1;
            self.flush();
        }

        if processed > 0 {
            let snapshot = self.orchestrator.snapshot(self.clock.now());
            self.snapshot_tx.send_replace(snapshot);
        }
        if processed == budget {
            debug!(
                budget,
                queued = self.orchestrator.queued(),
                "Turn budget spent, yielding to timers"
            );
        }
        processed
    }

    fn flush(&mut self) {
        for command in self.orchestrator.drain_outbox() {
            self.dispatch(command);
        }

        for event in self.orchestrator.drain_notifications() {
            let envelope = EventEnvelope::wrap(self.next_event_id, event);
            self.next_event_id = self.next_event_id.next();
            // No subscribers is fine.
            let _ = self.events_tx.send(envelope);
        }
    }

    fn dispatch(&self, command: Command) {
        let transport = Arc::clone(&self.transport);
        match command {
            Command::Place(command) => {
                let reply = self.outbox.clone();
                tokio::spawn(async move {
                    let event = deliver_placement(transport.as_ref(), &command).await;
                    if reply.send(event).await.is_err() {
                        debug!(command_id = %command.id, "Worker gone, placement outcome dropped");
                    }
                });
            }
            Command::Remove(command) => {
                tokio::spawn(async move {
                    if let Err(e) = transport.send_removal_command(&command).await {
                        warn!(
                            isolate_id = %command.isolate,
                            component = %command.component,
                            error = %e,
                            "Removal command failed"
                        );
                    }
                });
            }
            Command::Restart(request) => {
                tokio::spawn(async move {
                    tokio::time::sleep(request.delay).await;
                    if let Err(e) = transport.request_restart(&request).await {
                        warn!(
                            isolate_id = %request.isolate,
                            node = %request.node,
                            error = %e,
                            "Restart request failed"
                        );
                    }
                });
            }
        }
    }
}

/// Sends a placement command and turns the result into an inbound event.
async fn deliver_placement(transport: &dyn Transport, command: &PlacementCommand) -> Event {
    match tokio::time::timeout(command.deadline, transport.send_placement_command(command)).await {
        Ok(Ok(())) => Event::PlacementAck {
            command: command.id,
            outcome: AckOutcome::Accepted,
        },
        Ok(Err(e)) => Event::PlacementAck {
            command: command.id,
            outcome: AckOutcome::Rejected(e.to_string()),
        },
        Err(_) => Event::PlacementTimeout {
            command: command.id,
        },
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable client of a running orchestrator.
///
/// Inputs are sent to the worker; queries read the latest snapshot and never
/// wait on the loop.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Event>,
    snapshot_rx: watch::Receiver<FleetSnapshot>,
    events_tx: broadcast::Sender<EventEnvelope<FleetEvent>>,
    clock: Clock,
}

impl OrchestratorHandle {
    async fn send(&self, event: Event) -> Result<(), OrchestratorError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| OrchestratorError::Stopped)
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Registration handshake, stamped with the orchestrator clock.
    pub async fn register_isolate(
        &self,
        isolate: IsolateId,
        node: NodeName,
        kind: RuntimeKind,
        factories: Vec<FactoryName>,
    ) -> Result<(), OrchestratorError> {
        self.send(Event::Register(Registration {
            isolate,
            node,
            kind,
            factories,
            at: self.clock.now(),
        }))
        .await
    }

    pub async fn heartbeat(&self, isolate: IsolateId) -> Result<(), OrchestratorError> {
        let at = self.clock.now();
        self.heartbeat_at(isolate, at).await
    }

    /// Heartbeat carrying the sender's own timestamp.
    pub async fn heartbeat_at(
        &self,
        isolate: IsolateId,
        at: Timestamp,
    ) -> Result<(), OrchestratorError> {
        self.send(Event::Heartbeat { isolate, at }).await
    }

    pub async fn shutdown_isolate(&self, isolate: IsolateId) -> Result<(), OrchestratorError> {
        self.send(Event::Shutdown { isolate }).await
    }

    pub async fn load_composition(&self, composition: Composition) -> Result<(), OrchestratorError> {
        self.send(Event::LoadComposition(composition)).await
    }

    pub async fn unload_composition(
        &self,
        composition: CompositionName,
    ) -> Result<(), OrchestratorError> {
        self.send(Event::UnloadComposition(composition)).await
    }

    pub async fn components_added(
        &self,
        composition: CompositionName,
        specs: Vec<ComponentSpec>,
    ) -> Result<(), OrchestratorError> {
        self.send(Event::ComponentsAdded { composition, specs }).await
    }

    pub async fn components_removed(
        &self,
        composition: CompositionName,
        names: Vec<ComponentName>,
    ) -> Result<(), OrchestratorError> {
        self.send(Event::ComponentsRemoved { composition, names })
            .await
    }

    // ==== Queries ====

    /// Latest snapshot.
    pub fn snapshot(&self) -> FleetSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn get_placement(&self, component: &ComponentName) -> PlacementView {
        self.snapshot_rx.borrow().get_placement(component)
    }

    pub fn list_isolates(&self, node: Option<&NodeName>) -> Vec<IsolateView> {
        self.snapshot_rx.borrow().list_isolates(node)
    }

    pub fn list_pending_components(&self) -> Vec<PendingComponent> {
        self.snapshot_rx.borrow().list_pending_components()
    }

    pub fn list_nodes(&self) -> Vec<NodeView> {
        self.snapshot_rx.borrow().list_nodes()
    }

    /// Wait for a snapshot satisfying `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<FleetSnapshot, OrchestratorError>
    where
        F: FnMut(&FleetSnapshot) -> bool,
    {
        let mut rx = self.snapshot_rx.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        Ok(snapshot.clone())
    }

    /// Subscribe to placement, isolate and node events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope<FleetEvent>> {
        self.events_tx.subscribe()
    }
}
