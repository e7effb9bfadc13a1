//! Configuration file of the `hearth` binary.
//!
//! Loaded from TOML, created with defaults when missing, then overridden from
//! the command line and validated before anything starts.

use crate::cli::CliArgs;
use anyhow::{Context, Result};
use game_server::{ServerConfig, SessionFailurePolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use session_store::{RetryPolicy, SessionStoreConfig};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use unit_system::NamingConvention;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub sessions: SessionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Startup ordering and handshake settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub handshake_event: String,
    pub server_suffix: String,
    pub client_suffix: String,
    pub session_failure_policy: SessionFailurePolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        let naming = NamingConvention::default();
        Self {
            handshake_event: "client_ready".to_string(),
            server_suffix: naming.server_suffix,
            client_suffix: naming.client_suffix,
            session_failure_policy: SessionFailurePolicy::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One JSON file per key under `data_dir`; survives restarts.
    File,
    /// Process memory only.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub backend: BackendKind,
    pub data_dir: String,
    pub key_prefix: String,
    pub lock_timeout_ms: u64,
    pub lock_wait_ms: u64,
    pub autosave_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Fields every session is guaranteed to have, with their defaults.
    pub template: Value,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let store = SessionStoreConfig::default();
        Self {
            backend: BackendKind::File,
            data_dir: "data/sessions".to_string(),
            key_prefix: "player_".to_string(),
            lock_timeout_ms: millis(store.lock_timeout),
            lock_wait_ms: millis(store.lock_wait),
            autosave_interval_ms: millis(store.autosave_interval),
            retry_attempts: store.retry.max_attempts,
            retry_base_delay_ms: millis(store.retry.base_delay),
            retry_max_delay_ms: millis(store.retry.max_delay),
            template: Value::Object(Map::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter; `RUST_LOG` wins when set.
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl AppConfig {
    /// Loads `path`, writing a default file there first if it does not exist.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            let content = toml::to_string_pretty(&config)?;
            tokio::fs::write(path, content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(config)
        }
    }

    pub fn apply_overrides(&mut self, args: &CliArgs) {
        if let Some(data_dir) = &args.data_dir {
            self.sessions.data_dir = data_dir.to_string_lossy().to_string();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Checks values the server cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let lifecycle = &self.lifecycle;
        if lifecycle.handshake_event.is_empty() {
            return Err("Handshake event name cannot be empty".to_string());
        }
        if lifecycle.server_suffix.is_empty() || lifecycle.client_suffix.is_empty() {
            return Err("Unit name suffixes cannot be empty".to_string());
        }
        if lifecycle.server_suffix == lifecycle.client_suffix {
            return Err("Server and client suffixes must differ".to_string());
        }

        let sessions = &self.sessions;
        let durations = [
            ("lock_timeout_ms", sessions.lock_timeout_ms),
            ("lock_wait_ms", sessions.lock_wait_ms),
            ("autosave_interval_ms", sessions.autosave_interval_ms),
            ("retry_base_delay_ms", sessions.retry_base_delay_ms),
            ("retry_max_delay_ms", sessions.retry_max_delay_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(format!("sessions.{} must be greater than zero", name));
        }
        if sessions.retry_attempts == 0 {
            return Err("sessions.retry_attempts must be at least 1".to_string());
        }
        if sessions.autosave_interval_ms >= sessions.lock_timeout_ms {
            return Err(format!(
                "Auto-save interval ({}ms) must be shorter than the lock timeout ({}ms)",
                sessions.autosave_interval_ms, sessions.lock_timeout_ms
            ));
        }
        if sessions.retry_base_delay_ms > sessions.retry_max_delay_ms {
            return Err("sessions.retry_base_delay_ms cannot exceed retry_max_delay_ms".to_string());
        }
        if sessions.backend == BackendKind::File && sessions.data_dir.is_empty() {
            return Err("Session data directory cannot be empty".to_string());
        }
        if !sessions.template.is_object() {
            return Err("sessions.template must be a table".to_string());
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {LOG_LEVELS:?}",
                self.logging.level
            ));
        }
        Ok(())
    }

    pub fn to_server_config(&self) -> ServerConfig {
        let sessions = &self.sessions;
        ServerConfig {
            handshake_event: self.lifecycle.handshake_event.clone(),
            naming: NamingConvention {
                server_suffix: self.lifecycle.server_suffix.clone(),
                client_suffix: self.lifecycle.client_suffix.clone(),
            },
            session_failure_policy: self.lifecycle.session_failure_policy,
            session_key_prefix: sessions.key_prefix.clone(),
            sessions: SessionStoreConfig {
                lock_timeout: Duration::from_millis(sessions.lock_timeout_ms),
                lock_wait: Duration::from_millis(sessions.lock_wait_ms),
                autosave_interval: Duration::from_millis(sessions.autosave_interval_ms),
                retry: RetryPolicy {
                    max_attempts: sessions.retry_attempts,
                    base_delay: Duration::from_millis(sessions.retry_base_delay_ms),
                    max_delay: Duration::from_millis(sessions.retry_max_delay_ms),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_the_library_defaults() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let server = config.to_server_config();
        let library = ServerConfig::default();
        assert_eq!(server.handshake_event, library.handshake_event);
        assert_eq!(server.naming, library.naming);
        assert_eq!(server.session_key_prefix, library.session_key_prefix);
        assert_eq!(server.sessions, library.sessions);
    }

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();

        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let content = r#"
[lifecycle]
session_failure_policy = "kick"

[sessions]
backend = "memory"
lock_timeout_ms = 20000

[sessions.template]
coins = 0
level = "intro"
"#;
        tokio::fs::write(&path, content).await.unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();

        assert_eq!(config.lifecycle.session_failure_policy, SessionFailurePolicy::Kick);
        assert_eq!(config.lifecycle.handshake_event, "client_ready");
        assert_eq!(config.sessions.backend, BackendKind::Memory);
        assert_eq!(config.sessions.lock_timeout_ms, 20_000);
        assert_eq!(config.sessions.autosave_interval_ms, 10_000);
        assert_eq!(config.sessions.template, json!({"coins": 0, "level": "intro"}));
        assert_eq!(config.logging, LoggingSettings::default());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[sessions\nbackend = 1").await.unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            config_path: PathBuf::from("config.toml"),
            data_dir: Some(PathBuf::from("/srv/hearth")),
            log_level: Some("debug".to_string()),
            json_logs: true,
        };

        config.apply_overrides(&args);

        assert_eq!(config.sessions.data_dir, "/srv/hearth");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let mut config = AppConfig::default();
        config.sessions.lock_wait_ms = 0;
        let error = config.validate().unwrap_err();
        assert!(error.contains("lock_wait_ms"));

        let mut config = AppConfig::default();
        config.sessions.retry_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_autosave_must_be_shorter_than_lock_timeout() {
        let mut config = AppConfig::default();
        config.sessions.autosave_interval_ms = config.sessions.lock_timeout_ms;

        let error = config.validate().unwrap_err();
        assert!(error.contains("Auto-save interval"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));

        let mut config = AppConfig::default();
        config.lifecycle.client_suffix = "Service".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sessions.template = json!([1, 2]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_server_config_conversion() {
        let mut config = AppConfig::default();
        config.lifecycle.handshake_event = "hello".to_string();
        config.sessions.key_prefix = "user:".to_string();
        config.sessions.lock_wait_ms = 250;
        config.sessions.retry_attempts = 2;

        let server = config.to_server_config();

        assert_eq!(server.handshake_event, "hello");
        assert_eq!(server.session_key_prefix, "user:");
        assert_eq!(server.sessions.lock_wait, Duration::from_millis(250));
        assert_eq!(server.sessions.retry.max_attempts, 2);
    }
}
