use super::client::{ClientConnection, CompletedUnits, ConnectionInfo, ConnectionState};
use crate::error::ServerError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hearth_event_system::current_timestamp_ms;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use unit_system::ConnectionId;

/// What a connection's unit chain needs to start.
pub(crate) struct ChainStart {
    pub generation: u64,
    pub cancel: watch::Receiver<bool>,
    pub prior_teardown: Option<watch::Receiver<bool>>,
    pub completed_units: CompletedUnits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeOutcome {
    Started,
    /// The connection is past `AwaitingHandshake` already.
    Ignored(ConnectionState),
    Unknown,
}

/// A connection taken out of service, still to be awaited and cleaned up.
pub(crate) struct Teardown {
    pub id: ConnectionId,
    pub generation: u64,
    pub worker: Option<JoinHandle<()>>,
    pub prior_teardown: Option<watch::Receiver<bool>>,
    pub completed_units: CompletedUnits,
    pub done: Arc<watch::Sender<bool>>,
}

/// Every connection the server currently knows about, keyed by id.
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, ClientConnection>,
    next_generation: AtomicU64,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Registers a connection and moves it to `AwaitingHandshake`.
    ///
    /// An id whose previous attachment is still tearing down gets a new
    /// generation; its chain will wait for that teardown to finish.
    pub(crate) fn register(&self, id: ConnectionId) -> Result<u64, ServerError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let now = current_timestamp_ms();

        let mut connection = match self.connections.entry(id) {
            Entry::Occupied(occupied) if occupied.get().state != ConnectionState::TornDown => {
                return Err(ServerError::DuplicateConnection(id));
            }
            Entry::Occupied(mut occupied) => {
                let prior = occupied.get().torn_down.subscribe();
                debug!(
                    "{} reattached while generation {} is tearing down",
                    id,
                    occupied.get().generation
                );
                occupied.insert(ClientConnection::new(id, generation, now, Some(prior)));
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(ClientConnection::new(id, generation, now, None)),
        };
        connection.state = ConnectionState::AwaitingHandshake;
        info!("🔗 {} attached (generation {})", id, generation);
        Ok(generation)
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(|c| c.state)
    }

    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|c| c.info())
    }

    /// Every connection, sorted by id.
    pub fn all(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self.connections.iter().map(|c| c.info()).collect();
        all.sort_by_key(|info| info.id);
        all
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of connections that accept server-initiated messages.
    pub fn handshaken_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| c.state.accepts_server_messages())
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    /// Ids of every connection not yet torn down.
    pub(crate) fn live_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| c.state != ConnectionState::TornDown)
            .map(|c| c.id)
            .collect()
    }

    /// Moves an `AwaitingHandshake` connection to `InitializingUnits` and stores
    /// the worker `spawn` returns.
    pub(crate) fn begin_chain(
        &self,
        id: ConnectionId,
        spawn: impl FnOnce(ChainStart) -> JoinHandle<()>,
    ) -> HandshakeOutcome {
        let Some(mut connection) = self.connections.get_mut(&id) else {
            return HandshakeOutcome::Unknown;
        };
        if connection.state != ConnectionState::AwaitingHandshake {
            return HandshakeOutcome::Ignored(connection.state);
        }

        connection.state = ConnectionState::InitializingUnits;
        let start = ChainStart {
            generation: connection.generation,
            cancel: connection.cancel.subscribe(),
            prior_teardown: connection.prior_teardown.clone(),
            completed_units: connection.completed_units.clone(),
        };
        connection.worker = Some(spawn(start));
        HandshakeOutcome::Started
    }

    /// `InitializingUnits` → `Ready` for the given generation.
    pub(crate) fn mark_ready(&self, id: ConnectionId, generation: u64) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut connection)
                if connection.generation == generation
                    && connection.state == ConnectionState::InitializingUnits =>
            {
                connection.state = ConnectionState::Ready;
                true
            }
            _ => false,
        }
    }

    /// Marks the connection `TornDown` and signals its chain to stop.
    ///
    /// Returns `None` when the id is unknown or already being torn down, which
    /// makes repeated detaches no-ops.
    pub(crate) fn begin_teardown(&self, id: ConnectionId) -> Option<Teardown> {
        let mut connection = self.connections.get_mut(&id)?;
        if connection.state == ConnectionState::TornDown {
            return None;
        }

        connection.state = ConnectionState::TornDown;
        connection.cancel.send_replace(true);
        Some(Teardown {
            id,
            generation: connection.generation,
            worker: connection.worker.take(),
            prior_teardown: connection.prior_teardown.take(),
            completed_units: connection.completed_units.clone(),
            done: connection.torn_down.clone(),
        })
    }

    /// Forgets the torn-down attachment unless a newer one replaced it.
    pub(crate) fn forget(&self, teardown: &Teardown) {
        self.connections
            .remove_if(&teardown.id, |_, c| c.generation == teardown.generation);
        teardown.done.send_replace(true);
    }
}
