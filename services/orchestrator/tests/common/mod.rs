//! Shared helpers for orchestrator integration tests.

#![allow(dead_code)]

use orbit_id::{ComponentName, IsolateId};
use orbit_orchestrator::orchestrator::{Event, Registration};
use orbit_orchestrator::transport::Command;
use orbit_orchestrator::{ComponentSpec, Composition, Config, Orchestrator};
use orbit_reconcile::Timestamp;

pub fn config() -> Config {
    Config::default()
}

/// Config whose criteria only look at distance.
pub fn distance_only() -> Config {
    let mut config = Config::default();
    config.weights.distance = 1.0;
    config.weights.reliability = 0.0;
    config.weights.responsiveness = 0.0;
    config.weights.crash_affinity = 0.0;
    config
}

pub fn iso(id: &str) -> IsolateId {
    id.parse().unwrap()
}

pub fn comp(name: &str) -> ComponentName {
    name.parse().unwrap()
}

pub fn spec(name: &str, factory: &str) -> ComponentSpec {
    ComponentSpec::new(comp(name), factory.parse().unwrap(), "python".parse().unwrap())
}

pub fn register(id: &str, node: &str, factories: &[&str], at: Timestamp) -> Event {
    Event::Register(Registration {
        isolate: iso(id),
        node: node.parse().unwrap(),
        kind: "python".parse().unwrap(),
        factories: factories.iter().map(|f| f.parse().unwrap()).collect(),
        at,
    })
}

pub fn heartbeat(id: &str, at: Timestamp) -> Event {
    Event::Heartbeat { isolate: iso(id), at }
}

pub fn load(name: &str, specs: Vec<ComponentSpec>) -> Event {
    Event::LoadComposition(Composition::new(name.parse().unwrap(), specs))
}

/// Placement commands in the outbox, as (component, isolate, command).
pub fn placements(orchestrator: &mut Orchestrator) -> Vec<(String, String, orbit_id::CommandId)> {
    orchestrator
        .drain_outbox()
        .into_iter()
        .filter_map(|c| match c {
            Command::Place(p) => Some((p.component.to_string(), p.isolate.to_string(), p.id)),
            _ => None,
        })
        .collect()
}

/// Assignments as (component, isolate) strings, in declaration order.
pub fn assignments(orchestrator: &Orchestrator, now: Timestamp) -> Vec<(String, String)> {
    orchestrator
        .snapshot(now)
        .assignments()
        .into_iter()
        .map(|(c, i)| (c.to_string(), i.to_string()))
        .collect()
}
