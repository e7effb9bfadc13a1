//! The `hearth` server process.
//!
//! Loads `config.toml`, installs logging, opens the session backend and runs
//! the [`GameServer`] until SIGINT or SIGTERM, then flushes and releases every
//! session before exiting.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Result};
use cli::CliArgs;
use config::{AppConfig, BackendKind};
use game_server::{GameServer, LoopbackChannel, PersistenceService};
use session_store::{FileBackend, MemoryBackend, StorageBackend};
use std::sync::Arc;
use tracing::{error, info, warn};
use unit_system::UnitRegistry;

/// Capacity of the inbound event queue between transport and server.
const INBOUND_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    config.apply_overrides(&args);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

    logging::setup_logging(&config.logging)?;
    info!(
        "🔥 Hearth v{} starting (config: {})",
        env!("CARGO_PKG_VERSION"),
        args.config_path.display()
    );

    let backend: Arc<dyn StorageBackend> = match config.sessions.backend {
        BackendKind::File => {
            info!("💾 Sessions stored under {}", config.sessions.data_dir);
            Arc::new(FileBackend::open(&config.sessions.data_dir).await?)
        }
        BackendKind::Memory => {
            warn!("Sessions are kept in memory and will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
    };

    let server_config = config.to_server_config();
    let mut registry = UnitRegistry::new(server_config.naming.clone());
    registry.declare(Arc::new(PersistenceService::new(
        config.sessions.template.clone(),
    )));

    // No network transport ships with the server; the loopback channel stands
    // in until one is plugged in.
    let (channel, inbound) = LoopbackChannel::new(INBOUND_CAPACITY);
    let server = Arc::new(GameServer::new(
        server_config,
        registry,
        backend,
        Arc::new(channel),
    ));
    let stopper = server.shutdown_handle();

    let mut runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run(inbound).await })
    };

    let outcome = tokio::select! {
        outcome = &mut runner => outcome,
        signal = signals::wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                error!("Signal handling failed: {}", e);
            }
            let _ = stopper.send(());
            runner.await
        }
    };

    let report = outcome??;
    let stats = server.get_event_system().get_stats().await;
    info!(
        "📊 {} event(s) emitted, {} handler failure(s)",
        stats.events_emitted, stats.handler_failures
    );
    if !report.is_clean() {
        warn!("Startup reported {} failed unit(s)", report.failures.len());
    }

    info!("👋 Hearth stopped");
    Ok(())
}
