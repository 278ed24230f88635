//! Portfall Game Server
//!
//! Binds the WebSocket server, starts the phase clock, and runs until
//! shutdown.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use portfall::{GameServer, PhaseController, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();

    info!("Portfall Server v{}", VERSION);
    info!("Listening on {}", config.bind_addr);
    info!("Heartbeat interval: {:?}", config.heartbeat_interval);
    info!("Phase duration: {:?}", config.phase_duration);

    // The phase clock runs for the lifetime of the process, independent of
    // any connection.
    let phases = PhaseController::new(config.phase_duration);
    phases.on_phase_change(|state, event| {
        info!(?event, phase = ?state.phase, "phase change");
    });
    let opening = phases.start();
    info!(phase = ?opening.phase, "phase clock started");

    let server = GameServer::new(config);
    server.run().await?;

    Ok(())
}
