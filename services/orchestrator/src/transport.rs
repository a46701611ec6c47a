//! Transport interface and mock implementation.
//!
//! The transport carries commands from the orchestrator to isolate agents:
//! - Placement commands (instantiate a factory), acknowledged or failed
//! - Removal commands (fire-and-forget)
//! - Restart requests for lost isolates
//!
//! A mock implementation is provided for testing and development.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use orbit_id::{CommandId, ComponentName, FactoryName, IsolateId, NodeName, RuntimeKind};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::forker::RestartRequest;
use crate::model::ComponentSpec;

/// Instantiate `factory` as `component` on `isolate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementCommand {
    pub id: CommandId,
    pub isolate: IsolateId,
    pub node: NodeName,
    pub component: ComponentName,
    pub factory: FactoryName,
    pub kind: RuntimeKind,
    pub properties: Map<String, Value>,
    /// Time allowed for the acknowledgement.
    #[serde(with = "orbit_reconcile::duration_ms")]
    pub deadline: Duration,
}

impl PlacementCommand {
    pub fn new(
        id: CommandId,
        isolate: IsolateId,
        node: NodeName,
        spec: &ComponentSpec,
        deadline: Duration,
    ) -> Self {
        Self {
            id,
            isolate,
            node,
            component: spec.name.clone(),
            factory: spec.factory.clone(),
            kind: spec.kind.clone(),
            properties: spec.properties.clone(),
            deadline,
        }
    }
}

/// Tear down `component` on `isolate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalCommand {
    pub isolate: IsolateId,
    pub component: ComponentName,
}

/// Commands leaving the orchestrator loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Place(PlacementCommand),
    Remove(RemovalCommand),
    Restart(RestartRequest),
}

/// Transport to isolate agents.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a placement command and wait for the agent's acknowledgement.
    async fn send_placement_command(&self, command: &PlacementCommand)
        -> Result<(), TransportError>;

    /// Ask an agent to drop a component.
    async fn send_removal_command(&self, command: &RemovalCommand) -> Result<(), TransportError>;

    /// Ask the node's forker to restart an isolate.
    async fn request_restart(&self, request: &RestartRequest) -> Result<(), TransportError>;
}

/// Mock transport for testing and development.
///
/// Every command succeeds after `latency`, except placement commands sent to
/// a failing isolate (rejected) or a silent one (never acknowledged).
#[derive(Debug, Default)]
pub struct MockTransport {
    latency: Duration,
    failing: Mutex<BTreeSet<IsolateId>>,
    silent: Mutex<BTreeSet<IsolateId>>,
    sent: Mutex<Vec<Command>>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock transport that answers after `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Reject placement commands for `isolate`.
    pub async fn fail_isolate(&self, isolate: IsolateId) {
        self.failing.lock().await.insert(isolate);
    }

    /// Never acknowledge placement commands for `isolate`.
    pub async fn silence_isolate(&self, isolate: IsolateId) {
        self.silent.lock().await.insert(isolate);
    }

    /// Restore normal behavior for `isolate`.
    pub async fn heal_isolate(&self, isolate: &IsolateId) {
        self.failing.lock().await.remove(isolate);
        self.silent.lock().await.remove(isolate);
    }

    /// Commands received so far, in arrival order.
    pub async fn sent(&self) -> Vec<Command> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_placement_command(
        &self,
        command: &PlacementCommand,
    ) -> Result<(), TransportError> {
        self.sent.lock().await.push(Command::Place(command.clone()));
        info!(
            command_id = %command.id,
            isolate_id = %command.isolate,
            component = %command.component,
            factory = %command.factory,
            "[MOCK] Placement command"
        );

        let silent = self.silent.lock().await.contains(&command.isolate);
        if silent {
            // Outlive any deadline; the caller's timeout fires first.
            std::future::pending::<()>().await;
        }

        tokio::time::sleep(self.latency).await;

        let failing = self.failing.lock().await.contains(&command.isolate);
        if failing {
            return Err(TransportError::Rejected {
                isolate: command.isolate.clone(),
                reason: "mock transport configured to fail".to_string(),
            });
        }
        Ok(())
    }

    async fn send_removal_command(&self, command: &RemovalCommand) -> Result<(), TransportError> {
        debug!(
            isolate_id = %command.isolate,
            component = %command.component,
            "[MOCK] Removal command"
        );
        self.sent.lock().await.push(Command::Remove(command.clone()));
        Ok(())
    }

    async fn request_restart(&self, request: &RestartRequest) -> Result<(), TransportError> {
        debug!(
            isolate_id = %request.isolate,
            node = %request.node,
            attempt = request.attempt,
            "[MOCK] Restart request"
        );
        self.sent.lock().await.push(Command::Restart(request.clone()));
        Ok(())
    }
}
