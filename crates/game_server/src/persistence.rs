//! The unit that gives every connection its session.

use crate::events::SessionAcquiredEvent;
use async_trait::async_trait;
use hearth_event_system::current_timestamp_ms;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use unit_system::{ConnectionId, Unit, UnitCapabilities, UnitContext, UnitError};

/// Runs before every other server unit.
pub const PERSISTENCE_PRIORITY: i32 = i32::MIN;

/// Acquires the connection's session during `connection_init`.
///
/// Stored data is reconciled against `template`, so fields added to the
/// template later show up for existing players with their default values.
/// Release happens at teardown, not here.
pub struct PersistenceService {
    template: Value,
}

impl PersistenceService {
    pub const NAME: &'static str = "PersistenceService";

    pub fn new(template: Value) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &Value {
        &self.template
    }
}

#[async_trait]
impl Unit for PersistenceService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        PERSISTENCE_PRIORITY
    }

    fn capabilities(&self) -> UnitCapabilities {
        UnitCapabilities::CONNECTION_ONLY
    }

    async fn connection_init(
        &self,
        context: Arc<dyn UnitContext>,
        connection: ConnectionId,
    ) -> Result<(), UnitError> {
        let key = context.session_key(connection);
        let session = context
            .sessions()
            .acquire(&key, &self.template)
            .await
            .map_err(|e| {
                warn!("No session for {}: {}", connection, e);
                UnitError::from(e)
            })?;

        info!("💾 Session {} opened for {}", session.key(), connection);
        let event = SessionAcquiredEvent {
            connection,
            key,
            timestamp: current_timestamp_ms(),
        };
        if let Err(e) = context.events().emit_typed(&event).await {
            warn!("Failed to publish session acquisition for {}: {}", connection, e);
        }
        Ok(())
    }
}
