use unit_system::{ConnectionId, RegistryError};

/// Orchestrator-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `start()` was called on an orchestrator that already ran phase 1.
    #[error("Server already started")]
    AlreadyStarted,
    /// Unit discovery failed; fatal to startup.
    #[error("Unit registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("{0} is already attached")]
    DuplicateConnection(ConnectionId),
}
