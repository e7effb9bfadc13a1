//! Brings units up: once at process start, then once per connection.
//!
//! ## Phase 1: `start()`
//!
//! Server units run `init` one after another in priority order, then every
//! client unit runs `init` concurrently. After all of them have returned, the
//! handshake event goes to the peer exactly once and the phase is `Complete`.
//!
//! ## Phase 2: per connection
//!
//! A connection waits in `AwaitingHandshake` until it sends the handshake
//! event. Its chain then waits for phase 1, runs each server unit's
//! `connection_init` in phase 1 order and finally marks it `Ready`. Detaching
//! at any point cancels the chain between units, waits for the unit in flight,
//! and releases the connection's session.
//!
//! A failing or panicking hook is logged with the unit's name, published as
//! [`UnitInitFailedEvent`], and never stops the units after it.

use crate::channel::{Recipient, RemoteChannel};
use crate::config::{ServerConfig, SessionFailurePolicy};
use crate::connection::{completed, ChainStart, ConnectionManager, HandshakeOutcome, Teardown};
use crate::context::ServerContextImpl;
use crate::error::ServerError;
use crate::events::{
    ConnectionAttachedEvent, ConnectionReadyEvent, ConnectionTornDownEvent, InboundMessageEvent,
    PeerReadySignal, StartupCompleteEvent, UnitHook, UnitInitFailedEvent,
};
use futures::future::join_all;
use futures::FutureExt;
use hearth_event_system::{current_timestamp_ms, EventSystem, NamedEvent};
use once_cell::sync::OnceCell;
use serde_json::Value;
use session_store::{SessionState, SessionStore};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use unit_system::{ConnectionId, Unit, UnitContext, UnitError, UnitKind, UnitRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    NotStarted,
    Running,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub unit: String,
    pub error: String,
}

/// Outcome of phase 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Server units in the order they were initialized.
    pub server_units: Vec<String>,
    pub client_units: Vec<String>,
    pub failures: Vec<UnitFailure>,
    /// Whether the ready signal reached the channel.
    pub peer_signalled: bool,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.peer_signalled
    }
}

struct DiscoveredUnits {
    server: Vec<Arc<dyn Unit>>,
    client: Vec<Arc<dyn Unit>>,
}

struct Shared {
    config: ServerConfig,
    registry: UnitRegistry,
    units: OnceCell<DiscoveredUnits>,
    started: AtomicBool,
    phase: watch::Sender<StartupPhase>,
    events: Arc<EventSystem>,
    sessions: Arc<SessionStore>,
    channel: Arc<dyn RemoteChannel>,
    connections: Arc<ConnectionManager>,
    context: Arc<ServerContextImpl>,
}

/// Runs both lifecycle phases. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    shared: Arc<Shared>,
}

impl LifecycleOrchestrator {
    pub fn new(
        config: ServerConfig,
        registry: UnitRegistry,
        events: Arc<EventSystem>,
        sessions: Arc<SessionStore>,
        channel: Arc<dyn RemoteChannel>,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let context = Arc::new(ServerContextImpl::new(
            events.clone(),
            sessions.clone(),
            channel.clone(),
            connections.clone(),
            config.session_key_prefix.clone(),
        ));
        let (phase, _) = watch::channel(StartupPhase::NotStarted);

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                units: OnceCell::new(),
                started: AtomicBool::new(false),
                phase,
                events,
                sessions,
                channel,
                connections,
                context,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn events(&self) -> Arc<EventSystem> {
        self.shared.events.clone()
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.shared.sessions.clone()
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        self.shared.connections.clone()
    }

    pub fn context(&self) -> Arc<dyn UnitContext> {
        self.shared.context.clone()
    }

    pub fn phase(&self) -> StartupPhase {
        *self.shared.phase.borrow()
    }

    /// Runs phase 1. Fails only on a registry collision or a second call.
    pub async fn start(&self) -> Result<StartupReport, ServerError> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }

        let server = shared.registry.discover(UnitKind::Server)?;
        let client = shared.registry.discover(UnitKind::Client)?;
        let units = shared
            .units
            .get_or_init(|| DiscoveredUnits { server, client });

        shared.phase.send_replace(StartupPhase::Running);
        info!(
            "🚀 Phase 1: initializing {} server unit(s) and {} client unit(s)",
            units.server.len(),
            units.client.len()
        );

        let context: Arc<dyn UnitContext> = shared.context.clone();
        let mut report = StartupReport {
            server_units: names(&units.server),
            client_units: names(&units.client),
            ..Default::default()
        };

        for unit in &units.server {
            if !unit.capabilities().init {
                debug!("Unit {} has no init hook", unit.name());
                continue;
            }
            debug!("Initializing server unit {}", unit.name());
            match guarded(unit.init(context.clone())).await {
                Ok(()) => info!("Unit {} initialized successfully", unit.name()),
                Err(e) => {
                    let failure = shared.report_failure(unit.name(), UnitHook::Init, None, e).await;
                    report.failures.push(failure);
                }
            }
        }

        let client_inits = units
            .client
            .iter()
            .filter(|unit| unit.capabilities().init)
            .map(|unit| {
                let context = context.clone();
                async move { (unit.name(), guarded(unit.init(context)).await) }
            });
        for (name, result) in join_all(client_inits).await {
            match result {
                Ok(()) => info!("Unit {} initialized successfully", name),
                Err(e) => {
                    let failure = shared.report_failure(name, UnitHook::Init, None, e).await;
                    report.failures.push(failure);
                }
            }
        }

        report.peer_signalled = shared.signal_peer(units).await;
        shared.phase.send_replace(StartupPhase::Complete);

        let failed_units = report.failures.iter().map(|f| f.unit.clone()).collect();
        shared
            .publish(&StartupCompleteEvent {
                server_units: report.server_units.clone(),
                client_units: report.client_units.clone(),
                failed_units,
                timestamp: current_timestamp_ms(),
            })
            .await;

        if report.failures.is_empty() {
            info!("🎉 Phase 1 complete");
        } else {
            warn!("Phase 1 complete with {} failed unit(s)", report.failures.len());
            for failure in &report.failures {
                warn!("  {}: {}", failure.unit, failure.error);
            }
        }
        Ok(report)
    }

    /// Registers a new connection; it waits for its handshake.
    pub async fn attach(&self, id: ConnectionId) -> Result<(), ServerError> {
        let generation = self.shared.connections.register(id)?;
        self.shared
            .publish(&ConnectionAttachedEvent {
                connection: id,
                generation,
                timestamp: current_timestamp_ms(),
            })
            .await;
        Ok(())
    }

    /// Routes one inbound message.
    ///
    /// The handshake event starts the connection's unit chain; anything else is
    /// republished on the bus as `client:<event>`.
    pub async fn handle_message(&self, id: ConnectionId, event: &str, payload: Value) {
        if event == self.shared.config.handshake_event {
            self.handshake(id);
            return;
        }

        match self.shared.connections.state(id) {
            Some(state) if state != crate::ConnectionState::TornDown => {
                let inbound = InboundMessageEvent {
                    connection: id,
                    event: event.to_string(),
                    payload,
                };
                if let Err(e) = self
                    .shared
                    .events
                    .publish(&format!("client:{}", event), &inbound)
                    .await
                {
                    warn!("Failed to publish {} from {}: {}", event, id, e);
                }
            }
            _ => warn!("Dropping {} from unknown {}", event, id),
        }
    }

    fn handshake(&self, id: ConnectionId) {
        let shared = self.shared.clone();
        let outcome = self.shared.connections.begin_chain(id, move |start| {
            tokio::spawn(run_connection_chain(shared, id, start))
        });

        match outcome {
            HandshakeOutcome::Started => info!("🤝 Handshake from {}, initializing units", id),
            HandshakeOutcome::Ignored(state) => {
                debug!("Ignoring repeated handshake from {} ({:?})", id, state)
            }
            HandshakeOutcome::Unknown => warn!("Handshake from unknown {} ignored", id),
        }
    }

    /// Tears a connection down. Unknown ids and repeated calls are no-ops.
    pub async fn detach(&self, id: ConnectionId) {
        if let Some(teardown) = self.begin_detach(id) {
            self.finish_detach(teardown).await;
        }
    }

    /// The synchronous half of [`detach`](Self::detach): marks the connection
    /// `TornDown` and cancels its chain.
    pub(crate) fn begin_detach(&self, id: ConnectionId) -> Option<Teardown> {
        let teardown = self.shared.connections.begin_teardown(id);
        if teardown.is_none() {
            debug!("Ignoring detach of {}: unknown or already detached", id);
        }
        teardown
    }

    pub(crate) async fn finish_detach(&self, mut teardown: Teardown) {
        let shared = &self.shared;
        let id = teardown.id;

        if let Some(mut prior) = teardown.prior_teardown.take() {
            prior.wait_for(|done| *done).map(|_| ()).await;
        }
        if let Some(worker) = teardown.worker.take() {
            if let Err(e) = worker.await {
                error!("Unit chain for {} ended abnormally: {}", id, e);
            }
        }

        let key = shared.context.session_key(id);
        if let Err(e) = shared.sessions.release_key(&key).await {
            error!("❌ Failed to release session {} of {}: {}", key, id, e);
        }

        shared
            .publish(&ConnectionTornDownEvent {
                connection: id,
                completed_units: completed(&teardown.completed_units),
                timestamp: current_timestamp_ms(),
            })
            .await;
        shared.connections.forget(&teardown);
        info!("👋 {} torn down", id);
    }

    /// Tears down every connection, then releases every remaining session.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let teardowns: Vec<Teardown> = shared
            .connections
            .live_ids()
            .into_iter()
            .filter_map(|id| shared.connections.begin_teardown(id))
            .collect();

        info!("🧹 Tearing down {} connection(s)", teardowns.len());
        join_all(teardowns.into_iter().map(|t| self.finish_detach(t))).await;

        let failures = shared.sessions.release_all().await;
        if failures.is_empty() {
            info!("✅ All sessions released");
        } else {
            warn!("{} session(s) could not be released cleanly", failures.len());
        }
    }
}

impl Shared {
    async fn publish<E: NamedEvent>(&self, event: &E) {
        if let Err(e) = self.events.emit_typed(event).await {
            warn!("Failed to publish {}: {}", E::NAME, e);
        }
    }

    async fn report_failure(
        &self,
        unit: &str,
        hook: UnitHook,
        connection: Option<ConnectionId>,
        error: String,
    ) -> UnitFailure {
        match connection {
            Some(id) => error!("Unit {} connection_init failed for {}: {}", unit, id, error),
            None => error!("Unit {} initialization failed: {}", unit, error),
        }
        self.publish(&UnitInitFailedEvent {
            unit: unit.to_string(),
            hook,
            connection,
            error: error.clone(),
            timestamp: current_timestamp_ms(),
        })
        .await;
        UnitFailure {
            unit: unit.to_string(),
            error,
        }
    }

    async fn signal_peer(&self, units: &DiscoveredUnits) -> bool {
        let signal = PeerReadySignal {
            server_units: units.server.len(),
            client_units: units.client.len(),
            timestamp: current_timestamp_ms(),
        };
        let payload = match serde_json::to_value(&signal) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode ready signal: {}", e);
                return false;
            }
        };

        match self
            .channel
            .send(Recipient::Peer, &self.config.handshake_event, &payload)
            .await
        {
            Ok(()) => {
                info!("📣 Sent {} to peer", self.config.handshake_event);
                true
            }
            Err(e) => {
                error!("Failed to send {} to peer: {}", self.config.handshake_event, e);
                false
            }
        }
    }

    fn has_live_session(&self, id: ConnectionId) -> bool {
        self.sessions
            .get(&self.context.session_key(id))
            .map(|session| session.state() == SessionState::Active)
            .unwrap_or(false)
    }

    async fn kick(&self, id: ConnectionId, reason: &str) {
        warn!("Disconnecting {}: {}", id, reason);
        if let Err(e) = self.channel.disconnect(id, reason).await {
            error!("Failed to disconnect {}: {}", id, e);
        }
    }
}

async fn run_connection_chain(shared: Arc<Shared>, id: ConnectionId, start: ChainStart) {
    let ChainStart {
        generation,
        mut cancel,
        prior_teardown,
        completed_units,
    } = start;

    if let Some(mut prior) = prior_teardown {
        let cancelled = tokio::select! {
            _ = prior.wait_for(|done| *done).map(|_| ()) => false,
            _ = cancel.wait_for(|c| *c).map(|_| ()) => true,
        };
        if cancelled {
            return;
        }
    }

    let mut phase = shared.phase.subscribe();
    let cancelled = tokio::select! {
        _ = phase.wait_for(|p| *p == StartupPhase::Complete).map(|_| ()) => false,
        _ = cancel.wait_for(|c| *c).map(|_| ()) => true,
    };
    if cancelled {
        debug!("{} detached before phase 1 completed", id);
        return;
    }

    let Some(units) = shared.units.get() else {
        return;
    };
    let context: Arc<dyn UnitContext> = shared.context.clone();

    for unit in &units.server {
        let stop = *cancel.borrow();
        if stop {
            info!("Unit chain for {} cancelled before {}", id, unit.name());
            return;
        }
        if !unit.capabilities().connection_init {
            continue;
        }
        if unit.requires_session() && !shared.has_live_session(id) {
            warn!("Skipping unit {} for {}: no live session", unit.name(), id);
            if shared.config.session_failure_policy == SessionFailurePolicy::Kick {
                shared.kick(id, "session unavailable").await;
                return;
            }
            continue;
        }

        debug!("Running {} connection_init for {}", unit.name(), id);
        match guarded(unit.connection_init(context.clone(), id)).await {
            Ok(()) => {
                if let Ok(mut list) = completed_units.lock() {
                    list.push(unit.name().to_string());
                }
            }
            Err(e) => {
                shared
                    .report_failure(unit.name(), UnitHook::ConnectionInit, Some(id), e)
                    .await;
            }
        }
    }

    if shared.connections.mark_ready(id, generation) {
        let completed_units = completed(&completed_units);
        info!("✅ {} ready ({} unit(s) initialized)", id, completed_units.len());
        shared
            .publish(&ConnectionReadyEvent {
                connection: id,
                completed_units,
                timestamp: current_timestamp_ms(),
            })
            .await;
    }
}

/// Awaits a unit hook, turning both errors and panics into a message.
async fn guarded<F>(hook: F) -> Result<(), String>
where
    F: Future<Output = Result<(), UnitError>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("panicked: {}", message))
        }
    }
}

fn names(units: &[Arc<dyn Unit>]) -> Vec<String> {
    units.iter().map(|unit| unit.name().to_string()).collect()
}
