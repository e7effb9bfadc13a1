use crate::context::{ContextError, UnitContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use session_store::SessionError;
use std::sync::Arc;

/// Priority units get unless they say otherwise. Lower runs earlier.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Identity of one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection {}", self.0)
    }
}

/// Which lifecycle hooks a unit actually implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitCapabilities {
    pub init: bool,
    pub connection_init: bool,
}

impl UnitCapabilities {
    pub const ALL: Self = Self {
        init: true,
        connection_init: true,
    };
    pub const INIT_ONLY: Self = Self {
        init: true,
        connection_init: false,
    };
    pub const CONNECTION_ONLY: Self = Self {
        init: false,
        connection_init: true,
    };
}

impl Default for UnitCapabilities {
    fn default() -> Self {
        Self::ALL
    }
}

/// Failure of a single unit hook. Never fatal to the other units.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("Unit initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Connection initialization failed: {0}")]
    ConnectionInitFailed(String),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
    #[error("Unit runtime error: {0}")]
    Runtime(String),
}

/// A discoverable service unit.
///
/// Units are stateless at rest: the registry shares them as `Arc<dyn Unit>` and
/// client units are initialized concurrently, so hooks take `&self`. Anything a
/// unit needs to keep per connection belongs in the connection's session or
/// behind its own lock.
#[async_trait]
pub trait Unit: Send + Sync {
    /// Declared name. Decides the unit's kind and must be unique within it.
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    fn capabilities(&self) -> UnitCapabilities {
        UnitCapabilities::ALL
    }

    /// Units that touch the connection's session are skipped when it has none.
    fn requires_session(&self) -> bool {
        false
    }

    /// Runs once at process start.
    async fn init(&self, _context: Arc<dyn UnitContext>) -> Result<(), UnitError> {
        Ok(())
    }

    /// Runs once per connection, after its handshake, in priority order.
    async fn connection_init(
        &self,
        _context: Arc<dyn UnitContext>,
        _connection: ConnectionId,
    ) -> Result<(), UnitError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    #[async_trait]
    impl Unit for Plain {
        fn name(&self) -> &str {
            "PlainService"
        }
    }

    #[test]
    fn defaults() {
        let unit = Plain;
        assert_eq!(unit.priority(), DEFAULT_PRIORITY);
        assert_eq!(unit.capabilities(), UnitCapabilities::ALL);
        assert!(!unit.requires_session());
    }

    #[test]
    fn session_errors_convert() {
        let err: UnitError = SessionError::LockLost { key: "p1".into() }.into();
        assert_eq!(err.to_string(), "Session error: session p1 lost its lock");
    }
}
