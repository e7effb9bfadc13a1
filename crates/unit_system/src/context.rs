use crate::unit::ConnectionId;
use async_trait::async_trait;
use hearth_event_system::EventSystem;
use serde_json::Value;
use session_store::{Session, SessionStore};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Why an outbound message or context lookup was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The connection has not sent its handshake yet.
    #[error("{0} is not ready for server messages")]
    ConnectionNotReady(ConnectionId),
    #[error("unknown {0}")]
    UnknownConnection(ConnectionId),
    #[error("channel error: {0}")]
    Channel(String),
}

/// What the orchestrator exposes to units during their hooks.
#[async_trait]
pub trait UnitContext: Send + Sync {
    /// The shared event bus.
    fn events(&self) -> Arc<EventSystem>;

    fn log(&self, level: LogLevel, message: &str);

    /// Sends a server-initiated message to one connection.
    ///
    /// Refused with [`ContextError::ConnectionNotReady`] until the connection's
    /// handshake has arrived.
    async fn send_to_connection(
        &self,
        connection: ConnectionId,
        event_name: &str,
        payload: &Value,
    ) -> Result<(), ContextError>;

    /// Sends to every connection past its handshake; returns how many were reached.
    async fn broadcast(&self, event_name: &str, payload: &Value) -> Result<usize, ContextError>;

    /// Whether `connection` has sent its handshake and is still attached.
    fn is_ready(&self, connection: ConnectionId) -> bool;

    fn sessions(&self) -> Arc<SessionStore>;

    /// Persistence key of the connection's session.
    fn session_key(&self, connection: ConnectionId) -> String;

    /// The connection's live session, if one has been acquired.
    fn session(&self, connection: ConnectionId) -> Option<Session> {
        self.sessions().get(&self.session_key(connection))
    }
}
