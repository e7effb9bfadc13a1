//! Core game server: wires the pieces together and drives the orchestrator
//! from the channel's inbound events.

use crate::channel::{ChannelEvent, RemoteChannel};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::lifecycle::{LifecycleOrchestrator, StartupReport};
use hearth_event_system::{create_event_system, EventSystem};
use session_store::{SessionStore, StorageBackend};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};
use unit_system::UnitRegistry;

/// The game server.
///
/// Owns the event bus, the session store and the lifecycle orchestrator.
/// [`run`](Self::run) starts phase 1 and then serves the transport until the
/// inbound stream ends or [`shutdown`](Self::shutdown) is called.
pub struct GameServer {
    orchestrator: LifecycleOrchestrator,
    shutdown_sender: broadcast::Sender<()>,
    /// Detach teardowns still releasing their sessions.
    detaches: Mutex<JoinSet<()>>,
}

impl GameServer {
    pub fn new(
        config: ServerConfig,
        registry: UnitRegistry,
        backend: Arc<dyn StorageBackend>,
        channel: Arc<dyn RemoteChannel>,
    ) -> Self {
        let events = create_event_system();
        let sessions = Arc::new(SessionStore::new(backend, config.sessions.clone()));
        let orchestrator = LifecycleOrchestrator::new(config, registry, events, sessions, channel);
        let (shutdown_sender, _) = broadcast::channel(1);

        Self {
            orchestrator,
            shutdown_sender,
            detaches: Mutex::new(JoinSet::new()),
        }
    }

    pub fn orchestrator(&self) -> &LifecycleOrchestrator {
        &self.orchestrator
    }

    pub fn get_event_system(&self) -> Arc<EventSystem> {
        self.orchestrator.events()
    }

    pub fn get_session_store(&self) -> Arc<SessionStore> {
        self.orchestrator.sessions()
    }

    /// Runs phase 1, then serves `inbound` until it closes or shutdown is
    /// requested, and finally tears everything down.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<ChannelEvent>,
    ) -> Result<StartupReport, ServerError> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let report = self.orchestrator.start().await?;

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        info!("Inbound channel closed");
                        break;
                    }
                },
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.drain_detaches().await;
        self.orchestrator.shutdown().await;
        info!("Server stopped");
        Ok(report)
    }

    async fn dispatch(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Attached(id) => {
                if let Err(e) = self.orchestrator.attach(id).await {
                    error!("Attach of {} refused: {}", id, e);
                }
            }
            ChannelEvent::Message {
                connection,
                event,
                payload,
            } => {
                self.orchestrator
                    .handle_message(connection, &event, payload)
                    .await;
            }
            ChannelEvent::Detached(id) => {
                // Marked torn down here so a reattach queued right behind is
                // not taken for a duplicate; the slow part runs on its own task.
                if let Some(teardown) = self.orchestrator.begin_detach(id) {
                    let orchestrator = self.orchestrator.clone();
                    let mut detaches = self.detaches.lock().await;
                    while let Some(done) = detaches.try_join_next() {
                        report_detach(done);
                    }
                    detaches.spawn(async move { orchestrator.finish_detach(teardown).await });
                }
            }
        }
    }

    /// Waits for every detach teardown started by the run loop.
    async fn drain_detaches(&self) {
        let mut detaches = std::mem::take(&mut *self.detaches.lock().await);
        if !detaches.is_empty() {
            info!("Waiting for {} detach(es) in progress", detaches.len());
        }
        while let Some(done) = detaches.join_next().await {
            report_detach(done);
        }
    }

    /// Asks a running [`run`](Self::run) loop to stop.
    pub fn shutdown(&self) {
        info!("🛑 Shutting down server...");
        let _ = self.shutdown_sender.send(());
    }

    /// Handle that triggers shutdown from another task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }
}

fn report_detach(done: Result<(), JoinError>) {
    if let Err(e) = done {
        error!("Detach teardown ended abnormally: {}", e);
    }
}
