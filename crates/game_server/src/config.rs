//! Runtime settings of the orchestrator.

use serde::{Deserialize, Serialize};
use session_store::SessionStoreConfig;
use unit_system::NamingConvention;

/// What happens to a connection whose session could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionFailurePolicy {
    /// Keep the connection; units that need a session are skipped.
    #[default]
    Continue,
    /// Disconnect the connection through the channel.
    Kick,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Event a connection sends once its listeners are ready, and the event the
    /// server sends to its peer once phase 1 is done.
    pub handshake_event: String,
    pub naming: NamingConvention,
    pub session_failure_policy: SessionFailurePolicy,
    /// Session keys are `<prefix><connection id>`.
    pub session_key_prefix: String,
    pub sessions: SessionStoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_event: "client_ready".to_string(),
            naming: NamingConvention::default(),
            session_failure_policy: SessionFailurePolicy::default(),
            session_key_prefix: "player_".to_string(),
            sessions: SessionStoreConfig::default(),
        }
    }
}
