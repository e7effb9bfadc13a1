use crate::channel::{Recipient, RemoteChannel};
use crate::connection::ConnectionManager;
use async_trait::async_trait;
use hearth_event_system::EventSystem;
use serde_json::Value;
use session_store::SessionStore;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use unit_system::{ConnectionId, ContextError, LogLevel, UnitContext};

/// The [`UnitContext`] handed to every unit hook.
pub struct ServerContextImpl {
    events: Arc<EventSystem>,
    sessions: Arc<SessionStore>,
    channel: Arc<dyn RemoteChannel>,
    connections: Arc<ConnectionManager>,
    session_key_prefix: String,
}

impl ServerContextImpl {
    pub fn new(
        events: Arc<EventSystem>,
        sessions: Arc<SessionStore>,
        channel: Arc<dyn RemoteChannel>,
        connections: Arc<ConnectionManager>,
        session_key_prefix: String,
    ) -> Self {
        Self {
            events,
            sessions,
            channel,
            connections,
            session_key_prefix,
        }
    }

    fn check_accepts(&self, connection: ConnectionId) -> Result<(), ContextError> {
        match self.connections.state(connection) {
            Some(state) if state.accepts_server_messages() => Ok(()),
            Some(crate::ConnectionState::TornDown) | None => {
                Err(ContextError::UnknownConnection(connection))
            }
            Some(_) => Err(ContextError::ConnectionNotReady(connection)),
        }
    }
}

#[async_trait]
impl UnitContext for ServerContextImpl {
    fn events(&self) -> Arc<EventSystem> {
        self.events.clone()
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => error!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Trace => trace!("{}", message),
        }
    }

    async fn send_to_connection(
        &self,
        connection: ConnectionId,
        event_name: &str,
        payload: &Value,
    ) -> Result<(), ContextError> {
        self.check_accepts(connection)?;
        self.channel
            .send(Recipient::Connection(connection), event_name, payload)
            .await
            .map_err(|e| ContextError::Channel(e.to_string()))
    }

    async fn broadcast(&self, event_name: &str, payload: &Value) -> Result<usize, ContextError> {
        let mut reached = 0;
        for connection in self.connections.handshaken_ids() {
            match self
                .channel
                .send(Recipient::Connection(connection), event_name, payload)
                .await
            {
                Ok(()) => reached += 1,
                Err(e) => warn!("Broadcast of {} to {} failed: {}", event_name, connection, e),
            }
        }
        Ok(reached)
    }

    fn is_ready(&self, connection: ConnectionId) -> bool {
        self.check_accepts(connection).is_ok()
    }

    fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    fn session_key(&self, connection: ConnectionId) -> String {
        format!("{}{}", self.session_key_prefix, connection.0)
    }
}
