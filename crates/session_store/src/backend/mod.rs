//! Durable key/value backends with per-key exclusive locks.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::{BackendCallCounts, MemoryBackend};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Proof of lock ownership handed out by [`StorageBackend::try_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors a backend can report. Only `Unavailable` is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("key is locked by another owner")]
    AlreadyLocked,
    #[error("lock is not held by this owner")]
    LockNotHeld,
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Storage the session store persists into.
///
/// Implementations must respect the lock: `save`, `refresh_lock` and `unlock`
/// fail with [`BackendError::LockNotHeld`] when `token` is not the current owner.
/// A lock whose `ttl` has elapsed without a refresh may be taken by `try_lock`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    /// Returns the stored blob, or `None` when the key was never saved.
    async fn load(&self, key: &str) -> Result<Option<Value>, BackendError>;

    async fn save(&self, key: &str, token: LockToken, data: &Value) -> Result<(), BackendError>;

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<LockToken, BackendError>;

    async fn refresh_lock(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<(), BackendError>;

    async fn unlock(&self, key: &str, token: LockToken) -> Result<(), BackendError>;
}
