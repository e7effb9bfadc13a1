use crate::backend::{BackendError, LockToken, StorageBackend};
use crate::error::SessionError;
use crate::retry::RetryPolicy;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Lock held, writes accepted.
    Active,
    /// Flushed and unlocked. Terminal.
    Released,
    /// The backend lock went to another owner. Terminal; nothing is saved anymore.
    Lost,
}

/// A live lease on one persistence key plus its in-memory data.
///
/// Cheap to clone; all clones share the same data, dirty flag and lock.
/// Obtained only through [`SessionStore::acquire`](crate::SessionStore::acquire).
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    key: String,
    token: LockToken,
    data: Mutex<Value>,
    dirty: AtomicBool,
    releasing: AtomicBool,
    last_flush_ms: AtomicU64,
    state: watch::Sender<SessionState>,
    flush_gate: Mutex<()>,
    close_gate: Mutex<()>,
    /// Set once a close has run to completion; never cleared.
    closed: AtomicBool,
    backend: Arc<dyn StorageBackend>,
    retry: RetryPolicy,
    lock_timeout: Duration,
    autosave: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.inner.key)
            .field("token", &self.inner.token)
            .field("state", &self.state())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        key: String,
        token: LockToken,
        data: Value,
        dirty: bool,
        backend: Arc<dyn StorageBackend>,
        retry: RetryPolicy,
        lock_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Active);
        Self {
            inner: Arc::new(SessionInner {
                key,
                token,
                data: Mutex::new(data),
                dirty: AtomicBool::new(dirty),
                releasing: AtomicBool::new(false),
                last_flush_ms: AtomicU64::new(0),
                state,
                flush_gate: Mutex::new(()),
                close_gate: Mutex::new(()),
                closed: AtomicBool::new(false),
                backend,
                retry,
                lock_timeout,
                autosave: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn token(&self) -> LockToken {
        self.inner.token
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watches state transitions, e.g. to react when the lock is lost.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Unix millis of the last successful flush, `0` if none yet.
    pub fn last_flush_ms(&self) -> u64 {
        self.inner.last_flush_ms.load(Ordering::SeqCst)
    }

    /// Same key and same lock: two handles to one session.
    pub fn same_lease(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        let data = self.inner.data.lock().await;
        f(&data)
    }

    pub async fn snapshot(&self) -> Value {
        self.inner.data.lock().await.clone()
    }

    pub async fn get_field(&self, name: &str) -> Option<Value> {
        self.read(|data| data.get(name).cloned()).await
    }

    /// Mutates the data and marks the session dirty.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Value) -> R) -> Result<R, SessionError> {
        let mut data = self.inner.data.lock().await;
        self.ensure_writable()?;
        let result = f(&mut data);
        self.inner.dirty.store(true, Ordering::SeqCst);
        Ok(result)
    }

    pub async fn set_field(&self, name: &str, value: Value) -> Result<(), SessionError> {
        self.update(|data| {
            if let Value::Object(fields) = data {
                fields.insert(name.to_string(), value);
            }
        })
        .await
    }

    /// Flags the data for the next auto-save without changing it.
    pub fn mark_dirty(&self) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.inner.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Writes the data to the backend now if it is dirty.
    pub async fn flush(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Active => {}
            SessionState::Lost => return Err(self.lock_lost()),
            SessionState::Released => return Ok(()),
        }

        let _gate = self.inner.flush_gate.lock().await;
        if !self.inner.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let data = self.snapshot().await;

        let inner = &self.inner;
        let result = inner
            .retry
            .run("save", &inner.key, || {
                inner.backend.save(&inner.key, inner.token, &data)
            })
            .await;

        match result {
            Ok(()) => {
                inner.last_flush_ms.store(now_ms(), Ordering::SeqCst);
                debug!("💾 Flushed session {}", inner.key);
                Ok(())
            }
            Err(failure) => {
                inner.dirty.store(true, Ordering::SeqCst);
                if failure.error == BackendError::LockNotHeld {
                    self.mark_lost();
                }
                Err(failure.into_session_error(&inner.key))
            }
        }
    }

    fn ensure_writable(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Lost => Err(self.lock_lost()),
            SessionState::Released => Err(self.released()),
            SessionState::Active if self.inner.releasing.load(Ordering::SeqCst) => {
                Err(self.released())
            }
            SessionState::Active => Ok(()),
        }
    }

    fn lock_lost(&self) -> SessionError {
        SessionError::LockLost {
            key: self.inner.key.clone(),
        }
    }

    fn released(&self) -> SessionError {
        SessionError::Released {
            key: self.inner.key.clone(),
        }
    }

    fn mark_lost(&self) {
        let previous = self.inner.state.send_replace(SessionState::Lost);
        if previous == SessionState::Active {
            error!(
                "🔓 Session {} lost its lock to another owner; saving stopped",
                self.inner.key
            );
        }
    }

    pub(crate) fn start_autosave(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let state_rx = self.inner.state.subscribe();
        let handle = tokio::spawn(autosave_loop(weak, state_rx, interval));
        if let Ok(mut slot) = self.inner.autosave.lock() {
            *slot = Some(handle);
        }
    }

    async fn stop_autosave(&self) {
        let handle = match self.inner.autosave.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Auto-save worker for {} ended abnormally: {}", self.inner.key, e);
            }
        }
    }

    /// Final flush, stop auto-save, unlock.
    ///
    /// Calls are serialized: one arriving while another runs waits for it and
    /// returns `Ok(false)` if that call finished the session. A failed final
    /// flush leaves the session active so the release can be retried.
    pub(crate) async fn close(&self) -> Result<bool, SessionError> {
        let _gate = self.inner.close_gate.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.releasing.store(true, Ordering::SeqCst);

        if self.state() == SessionState::Lost {
            warn!(
                "Releasing session {} after losing its lock; unsaved changes are dropped",
                self.inner.key
            );
            self.mark_closed().await;
            return Ok(true);
        }

        // Wait out any update that started before `releasing` was set.
        drop(self.inner.data.lock().await);

        if let Err(e) = self.flush().await {
            if self.state() == SessionState::Lost {
                self.mark_closed().await;
            } else {
                self.inner.releasing.store(false, Ordering::SeqCst);
            }
            return Err(e);
        }

        self.inner.state.send_replace(SessionState::Released);
        self.mark_closed().await;

        let inner = &self.inner;
        let unlocked = inner
            .retry
            .run("unlock", &inner.key, || {
                inner.backend.unlock(&inner.key, inner.token)
            })
            .await;

        match unlocked {
            Ok(()) => {
                info!("🔓 Released session {}", inner.key);
                Ok(true)
            }
            Err(failure) if failure.error == BackendError::LockNotHeld => {
                warn!("Lock for {} had already expired at release", inner.key);
                Ok(true)
            }
            Err(failure) => Err(failure.into_session_error(&inner.key)),
        }
    }

    async fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.stop_autosave().await;
    }

    async fn refresh_lock(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let result = inner
            .retry
            .run("refresh_lock", &inner.key, || {
                inner
                    .backend
                    .refresh_lock(&inner.key, inner.token, inner.lock_timeout)
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(failure) => {
                if failure.error == BackendError::LockNotHeld {
                    self.mark_lost();
                }
                Err(failure.into_session_error(&inner.key))
            }
        }
    }
}

async fn autosave_loop(
    session: Weak<SessionInner>,
    mut state_rx: watch::Receiver<SessionState>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() != SessionState::Active {
                    break;
                }
                continue;
            }
        }

        let Some(inner) = session.upgrade() else {
            break;
        };
        let session = Session { inner };
        if session.state() != SessionState::Active {
            break;
        }

        if let Err(e) = session.flush().await {
            warn!("Auto-save of {} failed: {}", session.key(), e);
        }
        if session.state() == SessionState::Active {
            if let Err(e) = session.refresh_lock().await {
                warn!("Lock refresh for {} failed: {}", session.key(), e);
            }
        }
        if session.state() == SessionState::Lost {
            break;
        }
    }
    debug!("Auto-save worker stopped");
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
