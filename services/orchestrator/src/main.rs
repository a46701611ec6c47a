//! orbit orchestrator
//!
//! Runs the fleet orchestrator until interrupted.
//!
//! ## Architecture
//!
//! - **Worker**: owns fleet state and processes events one at a time
//! - **Sweep / Rescan timers**: expire silent isolates, retry unplaced components
//! - **Transport**: delivers placement, removal and restart commands (mock for now)
//! - **Event log**: fleet events, as JSON envelopes, at debug level

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use orbit_orchestrator::{Composition, Config, MockTransport};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fleet orchestrator: isolate liveness and component placement.
#[derive(Debug, Parser)]
#[command(name = "orchestrator", version, about)]
struct Args {
    /// TOML configuration file. ORBIT_* environment variables override it.
    #[arg(long, env = "ORBIT_CONFIG")]
    config: Option<PathBuf>,

    /// Composition file (TOML or JSON) to load at startup. Repeatable.
    #[arg(long)]
    composition: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting orbit orchestrator");
    info!(
        heartbeat_timeout_ms = config.heartbeat_timeout_ms,
        sweep_interval_ms = config.sweep_interval().as_millis() as u64,
        command_timeout_ms = config.command_timeout_ms,
        "Configuration loaded"
    );

    let compositions = args
        .composition
        .iter()
        .map(|path| load_composition_file(path))
        .collect::<Result<Vec<_>>>()?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the transport (mock for now)
    let transport = Arc::new(MockTransport::new());

    let (handle, worker) = orbit_orchestrator::start(&config, transport, shutdown_rx);

    // Fleet events go to the debug log
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => match envelope.to_json() {
                    Ok(json) => debug!(event = %json, "Fleet event"),
                    Err(e) => warn!(error = %e, "Failed to encode fleet event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Fleet event log lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    for composition in compositions {
        info!(composition = %composition.name, "Loading composition");
        handle.load_composition(composition).await?;
    }

    let mut worker = worker;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut worker => {
            match result {
                Ok(()) => warn!("Orchestrator worker exited"),
                Err(e) => error!(error = %e, "Orchestrator worker panicked"),
            }
            return Ok(());
        }
    }

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker.await {
        error!(error = %e, "Orchestrator worker panicked");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}

/// Parse a composition from TOML (by extension) or JSON.
fn load_composition_file(path: &Path) -> Result<Composition> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read composition from {:?}", path))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    if is_toml {
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse composition from {:?}", path))
    } else {
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse composition from {:?}", path))
    }
}
