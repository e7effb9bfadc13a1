//! Lifecycle events the server publishes on the bus.
//!
//! All of them live under the `core:` namespace, so units can listen with
//! either [`EventSystem::on_core`](hearth_event_system::EventSystem::on_core) and
//! the bare name, or with `on_typed` and the type.

use hearth_event_system::NamedEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use unit_system::ConnectionId;

/// Which hook of a unit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitHook {
    Init,
    ConnectionInit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitInitFailedEvent {
    pub unit: String,
    pub hook: UnitHook,
    pub connection: Option<ConnectionId>,
    pub error: String,
    pub timestamp: u64,
}

impl NamedEvent for UnitInitFailedEvent {
    const NAME: &'static str = "core:unit_init_failed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupCompleteEvent {
    pub server_units: Vec<String>,
    pub client_units: Vec<String>,
    pub failed_units: Vec<String>,
    pub timestamp: u64,
}

impl NamedEvent for StartupCompleteEvent {
    const NAME: &'static str = "core:startup_complete";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAttachedEvent {
    pub connection: ConnectionId,
    pub generation: u64,
    pub timestamp: u64,
}

impl NamedEvent for ConnectionAttachedEvent {
    const NAME: &'static str = "core:connection_attached";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionReadyEvent {
    pub connection: ConnectionId,
    pub completed_units: Vec<String>,
    pub timestamp: u64,
}

impl NamedEvent for ConnectionReadyEvent {
    const NAME: &'static str = "core:connection_ready";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTornDownEvent {
    pub connection: ConnectionId,
    pub completed_units: Vec<String>,
    pub timestamp: u64,
}

impl NamedEvent for ConnectionTornDownEvent {
    const NAME: &'static str = "core:connection_torn_down";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAcquiredEvent {
    pub connection: ConnectionId,
    pub key: String,
    pub timestamp: u64,
}

impl NamedEvent for SessionAcquiredEvent {
    const NAME: &'static str = "core:session_acquired";
}

/// Payload of the ready signal sent to the peer after phase 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReadySignal {
    pub server_units: usize,
    pub client_units: usize,
    pub timestamp: u64,
}

/// A non-handshake message from a connection, republished as `client:<event>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessageEvent {
    pub connection: ConnectionId,
    pub event: String,
    pub payload: Value,
}
