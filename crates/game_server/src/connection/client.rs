//! Per-connection state tracked by the orchestrator.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use unit_system::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Pending,
    AwaitingHandshake,
    InitializingUnits,
    Ready,
    TornDown,
}

impl ConnectionState {
    /// Past the handshake and still attached: server messages may be sent.
    pub fn accepts_server_messages(self) -> bool {
        matches!(
            self,
            ConnectionState::InitializingUnits | ConnectionState::Ready
        )
    }
}

/// Units that finished `connection_init`, in completion order.
pub(crate) type CompletedUnits = Arc<Mutex<Vec<String>>>;

pub(crate) fn completed(units: &CompletedUnits) -> Vec<String> {
    units.lock().map(|list| list.clone()).unwrap_or_default()
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub generation: u64,
    pub state: ConnectionState,
    pub attached_at: u64,
    pub completed_units: Vec<String>,
}

/// A connection the server knows about.
///
/// `generation` tells apart two attachments of the same id, so a reconnect
/// can be registered while the previous attachment is still tearing down.
pub(crate) struct ClientConnection {
    pub id: ConnectionId,
    pub generation: u64,
    pub state: ConnectionState,
    pub attached_at: u64,
    pub completed_units: CompletedUnits,
    pub cancel: watch::Sender<bool>,
    pub worker: Option<JoinHandle<()>>,
    /// Set to `true` once this attachment is completely torn down.
    pub torn_down: Arc<watch::Sender<bool>>,
    /// Teardown of the previous attachment of the same id, if still running.
    pub prior_teardown: Option<watch::Receiver<bool>>,
}

impl ClientConnection {
    pub fn new(
        id: ConnectionId,
        generation: u64,
        attached_at: u64,
        prior_teardown: Option<watch::Receiver<bool>>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let (torn_down, _) = watch::channel(false);
        Self {
            id,
            generation,
            state: ConnectionState::Pending,
            attached_at,
            completed_units: Arc::new(Mutex::new(Vec::new())),
            cancel,
            worker: None,
            torn_down: Arc::new(torn_down),
            prior_teardown,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            generation: self.generation,
            state: self.state,
            attached_at: self.attached_at,
            completed_units: completed(&self.completed_units),
        }
    }
}
