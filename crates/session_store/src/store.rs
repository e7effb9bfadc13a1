use crate::backend::{BackendError, StorageBackend};
use crate::error::SessionError;
use crate::reconcile::reconcile;
use crate::retry::{BackendFailure, RetryPolicy};
use crate::session::Session;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStoreConfig {
    /// How long a backend lock lives without a refresh.
    pub lock_timeout: Duration,
    /// How long `acquire` keeps trying a key held by someone else.
    pub lock_wait: Duration,
    pub autosave_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            lock_wait: Duration::from_secs(5),
            autosave_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Hands out [`Session`]s and tracks the ones this process holds.
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    config: SessionStoreConfig,
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>, config: SessionStoreConfig) -> Self {
        info!(
            "🗄️ Session store using {} backend (lock timeout {:?}, auto-save every {:?})",
            backend.name(),
            config.lock_timeout,
            config.autosave_interval
        );
        Self {
            backend,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionStoreConfig {
        &self.config
    }

    /// Locks `key`, loads its data (or starts from `template`), reconciles the
    /// two and starts auto-saving.
    ///
    /// While the key is held elsewhere this keeps retrying with backoff until
    /// `lock_wait` runs out, then fails with [`SessionError::AlreadyLocked`].
    pub async fn acquire(&self, key: &str, template: &Value) -> Result<Session, SessionError> {
        let token = self.lock(key).await?;

        let loaded = self
            .config
            .retry
            .run("load", key, || self.backend.load(key))
            .await;

        let stored = match loaded {
            Ok(Some(value)) if !value.is_object() => {
                self.abandon_lock(key, token).await;
                return Err(SessionError::CorruptData {
                    key: key.to_string(),
                    message: "stored record is not an object".to_string(),
                });
            }
            Ok(stored) => stored,
            Err(failure) => {
                self.abandon_lock(key, token).await;
                return Err(failure.into_session_error(key));
            }
        };

        let is_new = stored.is_none();
        let mut data = stored.unwrap_or_else(|| template.clone());
        let reconciled = reconcile(&mut data, template);
        if reconciled && !is_new {
            debug!("Added missing template fields to {}", key);
        }

        let session = Session::new(
            key.to_string(),
            token,
            data,
            is_new || reconciled,
            self.backend.clone(),
            self.config.retry.clone(),
            self.config.lock_timeout,
        );
        session.start_autosave(self.config.autosave_interval);
        self.sessions.insert(key.to_string(), session.clone());

        info!(
            "🔒 Acquired session {} ({})",
            key,
            if is_new { "new" } else { "existing" }
        );
        Ok(session)
    }

    async fn lock(&self, key: &str) -> Result<crate::LockToken, SessionError> {
        let ttl = self.config.lock_timeout;
        let deadline = Instant::now() + self.config.lock_wait;
        let mut contended = 0;

        loop {
            let attempt = self
                .config
                .retry
                .run("try_lock", key, || self.backend.try_lock(key, ttl))
                .await;

            match attempt {
                Ok(token) => return Ok(token),
                Err(BackendFailure {
                    error: BackendError::AlreadyLocked,
                    ..
                }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!("Session {} still locked after {:?}", key, self.config.lock_wait);
                        return Err(SessionError::AlreadyLocked {
                            key: key.to_string(),
                        });
                    }
                    contended += 1;
                    let delay = self.config.retry.backoff(contended).min(deadline - now);
                    debug!("Session {} is locked, retrying in {:?}", key, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => return Err(failure.into_session_error(key)),
            }
        }
    }

    async fn abandon_lock(&self, key: &str, token: crate::LockToken) {
        if let Err(e) = self.backend.unlock(key, token).await {
            warn!(
                "Could not unlock {} after a failed acquire, it expires in {:?}: {}",
                key, self.config.lock_timeout, e
            );
        }
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Flushes, stops auto-save and unlocks. Releasing twice is a no-op.
    ///
    /// Concurrent releases of one session wait for each other. The session
    /// stays registered while a failed final flush leaves it active.
    pub async fn release(&self, session: &Session) -> Result<(), SessionError> {
        let result = session.close().await;
        if session.state() != crate::SessionState::Active {
            self.sessions
                .remove_if(session.key(), |_, held| held.same_lease(session));
        }
        result.map(|_| ())
    }

    /// Releases the session held for `key`, if any.
    pub async fn release_key(&self, key: &str) -> Result<(), SessionError> {
        match self.get(key) {
            Some(session) => self.release(&session).await,
            None => Ok(()),
        }
    }

    /// Releases every held session; failures are logged and returned.
    pub async fn release_all(&self) -> Vec<SessionError> {
        let sessions: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut failures = Vec::new();
        for session in sessions {
            if let Err(e) = self.release(&session).await {
                error!("❌ Failed to release session {}: {}", session.key(), e);
                failures.push(e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBackend, SessionState};
    use serde_json::json;

    fn fast_config() -> SessionStoreConfig {
        SessionStoreConfig {
            lock_timeout: Duration::from_secs(30),
            lock_wait: Duration::from_millis(50),
            autosave_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
        }
    }

    fn store_on(backend: &Arc<MemoryBackend>, config: SessionStoreConfig) -> SessionStore {
        SessionStore::new(backend.clone(), config)
    }

    #[tokio::test]
    async fn acquire_reconciles_stored_data() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("player_1", json!({"coins": 50}));
        let store = store_on(&backend, fast_config());

        let session = store
            .acquire("player_1", &json!({"coins": 0, "level": "intro"}))
            .await
            .unwrap();

        assert_eq!(session.snapshot().await, json!({"coins": 50, "level": "intro"}));
        assert!(session.is_dirty());
        assert_eq!(store.active_keys(), vec!["player_1".to_string()]);
    }

    #[tokio::test]
    async fn second_owner_is_refused_while_locked() {
        let backend = Arc::new(MemoryBackend::new());
        let first = store_on(&backend, fast_config());
        let second = store_on(&backend, fast_config());

        let _held = first.acquire("player_1", &json!({})).await.unwrap();
        let refused = second.acquire("player_1", &json!({})).await;

        assert_eq!(
            refused.unwrap_err(),
            SessionError::AlreadyLocked {
                key: "player_1".into()
            }
        );
        assert!(second.get("player_1").is_none());
    }

    #[tokio::test]
    async fn waiting_owner_gets_key_after_release() {
        let backend = Arc::new(MemoryBackend::new());
        let first = store_on(&backend, fast_config());
        let second = Arc::new(store_on(
            &backend,
            SessionStoreConfig {
                lock_wait: Duration::from_secs(5),
                ..fast_config()
            },
        ));

        let held = first.acquire("player_1", &json!({"coins": 0})).await.unwrap();
        held.set_field("coins", json!(75)).await.unwrap();

        let waiter = {
            let second = second.clone();
            tokio::spawn(async move { second.acquire("player_1", &json!({"coins": 0})).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        first.release(&held).await.unwrap();

        let session = waiter.await.unwrap().unwrap();
        assert_eq!(session.get_field("coins").await, Some(json!(75)));
    }

    #[tokio::test]
    async fn stale_lock_of_crashed_owner_is_taken_over() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .try_lock("player_1", Duration::from_secs(30))
            .await
            .unwrap();
        backend.expire_lock("player_1");

        let store = store_on(&backend, fast_config());
        assert!(store.acquire("player_1", &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn transient_faults_are_retried() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, fast_config());
        backend.fail_next(2);

        let session = store.acquire("player_1", &json!({"coins": 0})).await;
        assert!(session.is_ok());
        assert_eq!(backend.call_counts().lock_attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_backend_unavailable() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, fast_config());
        backend.fail_next(10);

        let err = store.acquire("player_1", &json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::BackendUnavailable { attempts: 3, .. }
        ));
        assert!(store.active_keys().is_empty());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, fast_config());

        let session = store.acquire("player_1", &json!({"coins": 0})).await.unwrap();
        session.set_field("coins", json!(5)).await.unwrap();

        store.release(&session).await.unwrap();
        store.release(&session).await.unwrap();
        store.release_key("player_1").await.unwrap();

        let counts = backend.call_counts();
        assert_eq!(counts.saves, 1);
        assert_eq!(counts.unlocks, 1);
        assert_eq!(backend.record("player_1"), Some(json!({"coins": 5})));
        assert!(!backend.is_locked("player_1"));
        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(
            session.set_field("coins", json!(6)).await,
            Err(SessionError::Released {
                key: "player_1".into()
            })
        );
    }

    #[tokio::test]
    async fn failed_final_flush_keeps_session_active() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, fast_config());
        let session = store.acquire("player_1", &json!({"coins": 0})).await.unwrap();

        backend.fail_next(3);
        assert!(matches!(
            store.release(&session).await,
            Err(SessionError::BackendUnavailable { .. })
        ));
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.is_dirty());
        assert!(store.get("player_1").is_some());

        store.release(&session).await.unwrap();
        assert_eq!(backend.record("player_1"), Some(json!({"coins": 0})));
    }

    #[tokio::test]
    async fn concurrent_release_waits_out_a_failed_flush() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, fast_config());
        let session = store.acquire("player_1", &json!({"coins": 0})).await.unwrap();
        session.set_field("coins", json!(12)).await.unwrap();

        backend.fail_next(3);
        let (first, second) = tokio::join!(store.release(&session), store.release(&session));

        assert!(matches!(first, Err(SessionError::BackendUnavailable { .. })));
        assert_eq!(second, Ok(()));
        assert_eq!(session.state(), SessionState::Released);
        assert!(store.get("player_1").is_none());
        assert!(!backend.is_locked("player_1"));
        assert_eq!(backend.record("player_1"), Some(json!({"coins": 12})));
    }

    #[tokio::test]
    async fn release_by_key_racing_release_unlocks_once() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, fast_config());
        let session = store.acquire("player_1", &json!({"coins": 0})).await.unwrap();
        session.set_field("coins", json!(3)).await.unwrap();

        let (by_session, by_key) =
            tokio::join!(store.release(&session), store.release_key("player_1"));

        assert_eq!(by_session, Ok(()));
        assert_eq!(by_key, Ok(()));
        let counts = backend.call_counts();
        assert_eq!(counts.saves, 1);
        assert_eq!(counts.unlocks, 1);
        assert!(store.active_keys().is_empty());
        assert!(!backend.is_locked("player_1"));
    }

    #[tokio::test]
    async fn failed_releases_keep_the_session_registered() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, fast_config());
        let session = store.acquire("player_1", &json!({"coins": 0})).await.unwrap();

        backend.fail_next(6);
        let (first, second) =
            tokio::join!(store.release(&session), store.release_key("player_1"));

        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(session.state(), SessionState::Active);
        assert!(store.get("player_1").is_some());
        assert!(backend.is_locked("player_1"));

        store.release_key("player_1").await.unwrap();
        assert!(store.get("player_1").is_none());
        assert!(!backend.is_locked("player_1"));
    }

    #[tokio::test]
    async fn autosave_flushes_dirty_data_and_refreshes_lock() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(
            &backend,
            SessionStoreConfig {
                autosave_interval: Duration::from_millis(20),
                ..fast_config()
            },
        );
        let session = store.acquire("player_1", &json!({"coins": 0})).await.unwrap();
        session.set_field("coins", json!(9)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(backend.record("player_1"), Some(json!({"coins": 9})));
        assert!(!session.is_dirty());
        assert!(session.last_flush_ms() > 0);
        assert!(backend.call_counts().refreshes >= 1);
    }

    #[tokio::test]
    async fn session_is_lost_when_lock_changes_hands() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(
            &backend,
            SessionStoreConfig {
                autosave_interval: Duration::from_millis(20),
                ..fast_config()
            },
        );
        let session = store.acquire("player_1", &json!({"coins": 0})).await.unwrap();

        backend.expire_lock("player_1");
        let intruder = store_on(&backend, fast_config());
        let _taken = intruder.acquire("player_1", &json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(session.state(), SessionState::Lost);
        assert_eq!(
            session.set_field("coins", json!(1)).await,
            Err(SessionError::LockLost {
                key: "player_1".into()
            })
        );
        store.release(&session).await.unwrap();
        assert!(store.active_keys().is_empty());
    }
}
