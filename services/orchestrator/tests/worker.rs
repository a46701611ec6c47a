//! Worker tests: the tokio loop against the mock transport, on paused time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use orbit_events::{FleetEvent, IsolateState};
use orbit_orchestrator::transport::Command;
use orbit_reconcile::Timestamp;
use orbit_orchestrator::{
    start, Composition, FleetSnapshot, MockTransport, OrchestratorHandle, PlacementView,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

async fn join(handle: &OrchestratorHandle, id: &str, node: &str) {
    handle
        .register_isolate(
            iso(id),
            node.parse().unwrap(),
            "python".parse().unwrap(),
            vec!["F".parse().unwrap()],
        )
        .await
        .unwrap();
}

/// Heartbeats `ids` every 500ms until the worker stops.
fn keep_alive(handle: &OrchestratorHandle, ids: &[&str]) -> JoinHandle<()> {
    let handle = handle.clone();
    let ids: Vec<_> = ids.iter().map(|id| iso(id)).collect();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            for id in &ids {
                if handle.heartbeat(id.clone()).await.is_err() {
                    return;
                }
            }
        }
    })
}

async fn wait(
    handle: &OrchestratorHandle,
    predicate: impl FnMut(&FleetSnapshot) -> bool,
) -> FleetSnapshot {
    tokio::time::timeout(Duration::from_secs(60), handle.wait_for(predicate))
        .await
        .expect("condition reached in time")
        .unwrap()
}

fn assigned(component: &str, isolate: &str) -> impl FnMut(&FleetSnapshot) -> bool {
    let component = comp(component);
    let isolate = iso(isolate);
    move |s| s.get_placement(&component) == PlacementView::Assigned(isolate.clone())
}

#[tokio::test(start_paused = true)]
async fn test_silent_isolate_is_lost_and_component_moves() {
    let transport = Arc::new(MockTransport::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, worker) = start(&config(), transport.clone(), shutdown_rx);

    join(&handle, "iso-A", "n1").await;
    join(&handle, "iso-B", "n2").await;
    let beating = keep_alive(&handle, &["iso-B"]);

    let c1 = spec("c1", "F").preferring("n1".parse().unwrap());
    handle
        .load_composition(Composition::new("app".parse().unwrap(), vec![c1]))
        .await
        .unwrap();
    wait(&handle, assigned("c1", "iso-A")).await;

    let snapshot = wait(&handle, assigned("c1", "iso-B")).await;
    let a = snapshot
        .list_isolates(Some(&"n1".parse().unwrap()))
        .remove(0);
    assert_eq!(a.state, IsolateState::Lost);
    assert!(!snapshot.list_nodes()[0].reachable);

    // The restart request goes out after its backoff delay.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let restarts: Vec<_> = transport
        .sent()
        .await
        .into_iter()
        .filter_map(|c| match c {
            Command::Restart(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(restarts.len(), 1);
    assert_eq!(restarts[0].isolate, iso("iso-A"));
    assert_eq!(restarts[0].attempt, 1);

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
    beating.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rejected_placement_moves_to_next_isolate() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_isolate(iso("iso-A")).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, worker) = start(&config(), transport.clone(), shutdown_rx);

    join(&handle, "iso-A", "n1").await;
    join(&handle, "iso-B", "n2").await;
    let beating = keep_alive(&handle, &["iso-A", "iso-B"]);

    handle
        .load_composition(Composition::new("app".parse().unwrap(), vec![spec("c1", "F")]))
        .await
        .unwrap();
    let snapshot = wait(&handle, assigned("c1", "iso-B")).await;
    assert!(snapshot.list_pending_components().is_empty());

    let targets: Vec<String> = transport
        .sent()
        .await
        .into_iter()
        .filter_map(|c| match c {
            Command::Place(p) => Some(p.isolate.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(targets, vec!["iso-A", "iso-B"]);

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
    beating.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_placement_times_out_and_moves() {
    let transport = Arc::new(MockTransport::with_latency(Duration::from_millis(20)));
    transport.silence_isolate(iso("iso-A")).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, worker) = start(&config(), transport.clone(), shutdown_rx);
    let mut events = handle.subscribe();

    join(&handle, "iso-A", "n1").await;
    join(&handle, "iso-B", "n2").await;
    let beating = keep_alive(&handle, &["iso-A", "iso-B"]);

    handle
        .load_composition(Composition::new("app".parse().unwrap(), vec![spec("c3", "F")]))
        .await
        .unwrap();
    wait(&handle, assigned("c3", "iso-B")).await;

    let mut moves = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        if let FleetEvent::PlacementChanged(p) = envelope.payload {
            moves.push(p.new_isolate.map(|i| i.to_string()));
        }
    }
    assert_eq!(
        moves,
        vec![Some("iso-A".to_string()), None, Some("iso-B".to_string())]
    );

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
    beating.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_isolate_is_stopped_and_keeps_heartbeats_ignored() {
    let transport = Arc::new(MockTransport::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, worker) = start(&config(), transport.clone(), shutdown_rx);

    join(&handle, "iso-A", "n1").await;
    handle
        .load_composition(Composition::new("app".parse().unwrap(), vec![spec("c1", "F")]))
        .await
        .unwrap();
    wait(&handle, assigned("c1", "iso-A")).await;

    handle.shutdown_isolate(iso("iso-A")).await.unwrap();
    handle.heartbeat(iso("iso-A")).await.unwrap();
    let snapshot = wait(&handle, |s| {
        s.isolates
            .first()
            .is_some_and(|i| i.state == IsolateState::Stopped)
    })
    .await;
    assert_eq!(
        snapshot.get_placement(&comp("c1")),
        PlacementView::Pending(orbit_events::PendingReason::NoCompatibleIsolate)
    );
    assert!(snapshot.list_isolates(None)[0].hosted_components.is_empty());
    assert_eq!(handle.list_pending_components().len(), 1);

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sweep_still_runs_under_heartbeat_flood() {
    let config = config();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, worker) = start(&config, Arc::new(MockTransport::new()), shutdown_rx);

    join(&handle, "iso-A", "n1").await;
    join(&handle, "iso-B", "n2").await;
    wait(&handle, |s| {
        s.isolates.len() == 2 && s.isolates.iter().all(|i| i.state == IsolateState::Running)
    })
    .await;

    // iso-B floods the inbox with heartbeats that keep it alive for an hour.
    let flood = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let far = Timestamp::from_secs(3600);
            loop {
                for _ in 0..64 {
                    if handle.heartbeat_at(iso("iso-B"), far).await.is_err() {
                        return;
                    }
                }
                tokio::task::yield_now().await;
            }
        })
    };

    tokio::time::advance(Duration::from_millis(config.heartbeat_timeout_ms + 1000)).await;
    let snapshot = wait(&handle, |s| {
        s.isolates
            .iter()
            .any(|i| i.id == iso("iso-A") && i.state == IsolateState::Lost)
    })
    .await;
    let b = snapshot
        .list_isolates(Some(&"n2".parse().unwrap()))
        .remove(0);
    assert_eq!(b.state, IsolateState::Running);

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
    flood.await.unwrap();
}
