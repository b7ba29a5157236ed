//! Campus Guessr Match Server
//!
//! Loads configuration from the environment and serves versus matches
//! over WebSocket until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use campus_guessr::{
    VERSION,
    game::{
        catalog::{LocationCatalog, MemoryCatalog},
        record::{JsonLinesMatchStore, LogMatchStore, MatchStore},
    },
    network::server::{GameServer, ServerConfig},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Campus Guessr Server v{}", VERSION);

    let config = ServerConfig::from_env().context("invalid server configuration")?;
    info!(
        "Rounds: {} x {:?} (intermission {:?}, timed: {}), reconnect grace {:?}",
        config.session.match_config.round_limit,
        config.session.match_config.round_timeout,
        config.session.match_config.intermission,
        config.session.match_config.timed_mode,
        config.session.reconnect_grace,
    );

    let catalog: Arc<dyn LocationCatalog> = match &config.locations_file {
        Some(path) => {
            let catalog = MemoryCatalog::from_json_file(path)
                .with_context(|| format!("loading locations from {}", path.display()))?;
            info!("Loaded {} locations from {}", catalog.len(), path.display());
            Arc::new(catalog)
        }
        None => {
            warn!("LOCATIONS_FILE not set; every round will fail with no locations");
            Arc::new(MemoryCatalog::default())
        }
    };

    let store: Arc<dyn MatchStore> = match &config.match_log_file {
        Some(path) => {
            info!("Appending finished matches to {}", path.display());
            Arc::new(JsonLinesMatchStore::new(path.clone()))
        }
        None => Arc::new(LogMatchStore),
    };

    let server = Arc::new(GameServer::new(config, catalog, store));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
