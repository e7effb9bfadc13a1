//! In-process backend.
//!
//! Several [`SessionStore`](crate::SessionStore)s sharing one `Arc<MemoryBackend>`
//! behave like several processes sharing one database, which is how the lock
//! semantics are exercised in tests. Faults can be injected with
//! [`MemoryBackend::fail_next`].

use super::{BackendError, LockToken, StorageBackend};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: LockToken,
    expires_at: Instant,
}

/// Number of calls the backend has served, by operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendCallCounts {
    pub loads: u64,
    pub saves: u64,
    pub lock_attempts: u64,
    pub refreshes: u64,
    pub unlocks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    saves: AtomicU64,
    lock_attempts: AtomicU64,
    refreshes: AtomicU64,
    unlocks: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<String, Value>,
    locks: DashMap<String, LockEntry>,
    pending_faults: AtomicU32,
    counters: Counters,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a stored record, as if a previous session had saved it.
    pub fn insert(&self, key: impl Into<String>, data: Value) {
        self.records.insert(key.into(), data);
    }

    /// The record currently stored for `key`.
    pub fn record(&self, key: &str) -> Option<Value> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    /// Makes the next `count` calls fail with [`BackendError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Expires the lock on `key` right away, like a crashed owner whose ttl ran out.
    pub fn expire_lock(&self, key: &str) {
        if let Some(mut entry) = self.locks.get_mut(key) {
            entry.expires_at = Instant::now();
        }
    }

    pub fn call_counts(&self) -> BackendCallCounts {
        BackendCallCounts {
            loads: self.counters.loads.load(Ordering::SeqCst),
            saves: self.counters.saves.load(Ordering::SeqCst),
            lock_attempts: self.counters.lock_attempts.load(Ordering::SeqCst),
            refreshes: self.counters.refreshes.load(Ordering::SeqCst),
            unlocks: self.counters.unlocks.load(Ordering::SeqCst),
        }
    }

    fn inject_fault(&self, operation: &str) -> Result<(), BackendError> {
        let consumed = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            trace!("Injected fault for {}", operation);
            return Err(BackendError::Unavailable(format!(
                "injected fault during {}",
                operation
            )));
        }
        Ok(())
    }

    fn holds(&self, key: &str, token: LockToken) -> bool {
        self.locks
            .get(key)
            .map(|entry| entry.token == token)
            .unwrap_or(false)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.inject_fault("load")?;
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.record(key))
    }

    async fn save(&self, key: &str, token: LockToken, data: &Value) -> Result<(), BackendError> {
        self.inject_fault("save")?;
        if !self.holds(key, token) {
            return Err(BackendError::LockNotHeld);
        }
        self.counters.saves.fetch_add(1, Ordering::SeqCst);
        self.records.insert(key.to_string(), data.clone());
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<LockToken, BackendError> {
        self.inject_fault("try_lock")?;
        self.counters.lock_attempts.fetch_add(1, Ordering::SeqCst);

        let now = Instant::now();
        let fresh = LockEntry {
            token: LockToken::new(),
            expires_at: now + ttl,
        };

        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Err(BackendError::AlreadyLocked);
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        Ok(fresh.token)
    }

    async fn refresh_lock(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        self.inject_fault("refresh_lock")?;
        self.counters.refreshes.fetch_add(1, Ordering::SeqCst);
        match self.locks.get_mut(key) {
            Some(mut entry) if entry.token == token => {
                entry.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(BackendError::LockNotHeld),
        }
    }

    async fn unlock(&self, key: &str, token: LockToken) -> Result<(), BackendError> {
        self.inject_fault("unlock")?;
        self.counters.unlocks.fetch_add(1, Ordering::SeqCst);
        match self.locks.remove_if(key, |_, entry| entry.token == token) {
            Some(_) => Ok(()),
            None => Err(BackendError::LockNotHeld),
        }
    }
}
