//! Directory-backed storage: one `<key>.json` record and one `<key>.lock` file per key.
//!
//! Every change to a key's lock, and every record write, happens while holding
//! a `<key>.guard` file created with `create_new`, so two processes on the same
//! filesystem cannot both take a free or abandoned key. Records and lock files
//! are written to a temporary file and renamed into place.

use super::{BackendError, LockToken, StorageBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long an operation waits for another one on the same key.
const GUARD_WAIT: Duration = Duration::from_secs(2);
const GUARD_POLL: Duration = Duration::from_millis(5);
/// Guards are held for a few file operations; one this old is orphaned.
const GUARD_STALE: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    token: LockToken,
    expires_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Opens (and creates if needed) the storage directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| unavailable("create storage directory", &root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.lock", encode_key(key)))
    }

    fn guard_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.guard", encode_key(key)))
    }

    async fn read_lock(&self, key: &str) -> Result<Option<LockRecord>, BackendError> {
        let path = self.lock_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("read lock", &path, e)),
        }
    }

    async fn holds(&self, key: &str, token: LockToken) -> Result<bool, BackendError> {
        Ok(self
            .read_lock(key)
            .await?
            .map(|lock| lock.token == token)
            .unwrap_or(false))
    }

    /// A lock file that is expired, or unreadable and older than `ttl`, belongs to nobody.
    async fn is_abandoned(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        if let Some(lock) = self.read_lock(key).await? {
            return Ok(lock.expires_at_ms <= now_ms());
        }

        let path = self.lock_path(key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(modified_age(&meta) >= ttl),
            // Removed between our two reads; the next attempt will find it free.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(unavailable("inspect lock", &path, e)),
        }
    }

    async fn enter_guard(&self, key: &str) -> Result<KeyGuard, BackendError> {
        let path = self.guard_path(key);
        let deadline = Instant::now() + GUARD_WAIT;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(KeyGuard { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if file_age(&path).await.is_some_and(|age| age >= GUARD_STALE) {
                        // Left behind by a process that died mid-operation.
                        warn!("Clearing stale guard {}", path.display());
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(BackendError::Unavailable(format!(
                            "{} is busy",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(GUARD_POLL).await;
                }
                Err(e) => return Err(unavailable("create guard", &path, e)),
            }
        }
    }

    async fn lock_guarded(&self, key: &str, ttl: Duration) -> Result<LockToken, BackendError> {
        let path = self.lock_path(key);
        match tokio::fs::metadata(&path).await {
            Ok(_) => {
                if !self.is_abandoned(key, ttl).await? {
                    return Err(BackendError::AlreadyLocked);
                }
                warn!("Taking over abandoned lock for {}", key);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable("inspect lock", &path, e)),
        }

        let token = LockToken::new();
        write_atomically(&path, &lock_bytes(token, ttl)?).await?;
        if !self.holds(key, token).await? {
            return Err(BackendError::AlreadyLocked);
        }
        Ok(token)
    }

    async fn unlock_guarded(&self, key: &str, token: LockToken) -> Result<(), BackendError> {
        if !self.holds(key, token).await? {
            return Err(BackendError::LockNotHeld);
        }
        let path = self.lock_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed lock file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BackendError::LockNotHeld),
            Err(e) => Err(unavailable("remove lock", &path, e)),
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, BackendError> {
        let path = self.record_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| BackendError::Corrupt(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("read record", &path, e)),
        }
    }

    async fn save(&self, key: &str, token: LockToken, data: &Value) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec_pretty(data)
            .map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let guard = self.enter_guard(key).await?;
        let result = match self.holds(key, token).await {
            Ok(true) => write_atomically(&self.record_path(key), &bytes).await,
            Ok(false) => Err(BackendError::LockNotHeld),
            Err(e) => Err(e),
        };
        guard.leave().await;
        result
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<LockToken, BackendError> {
        let guard = self.enter_guard(key).await?;
        let result = self.lock_guarded(key, ttl).await;
        guard.leave().await;
        result
    }

    async fn refresh_lock(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let bytes = lock_bytes(token, ttl)?;
        let guard = self.enter_guard(key).await?;
        let result = match self.holds(key, token).await {
            Ok(true) => write_atomically(&self.lock_path(key), &bytes).await,
            Ok(false) => Err(BackendError::LockNotHeld),
            Err(e) => Err(e),
        };
        guard.leave().await;
        result
    }

    async fn unlock(&self, key: &str, token: LockToken) -> Result<(), BackendError> {
        let guard = self.enter_guard(key).await?;
        let result = self.unlock_guarded(key, token).await;
        guard.leave().await;
        result
    }
}

/// Held while a key's lock file is inspected and changed, and while its owner
/// writes the record. Lock checks and the writes they permit never interleave
/// with another process taking the lock over.
struct KeyGuard {
    path: PathBuf,
}

impl KeyGuard {
    async fn leave(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove guard {}: {}", self.path.display(), e);
            }
        }
    }
}

fn lock_bytes(token: LockToken, ttl: Duration) -> Result<Vec<u8>, BackendError> {
    let record = LockRecord {
        token,
        expires_at_ms: now_ms().saturating_add(ttl.as_millis() as u64),
    };
    serde_json::to_vec(&record).map_err(|e| BackendError::Corrupt(e.to_string()))
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| unavailable("write temp file", &tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(unavailable("rename temp file", path, e));
    }
    Ok(())
}

/// Keeps `[A-Za-z0-9_-]`, escapes everything else as `~XX` so keys map to distinct file names.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("~{:02X}", byte));
        }
    }
    encoded
}

fn modified_age(meta: &std::fs::Metadata) -> Duration {
    meta.modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default()
}

async fn file_age(path: &Path) -> Option<Duration> {
    tokio::fs::metadata(path).await.ok().map(|meta| modified_age(&meta))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn unavailable(action: &str, path: &Path, error: std::io::Error) -> BackendError {
    BackendError::Unavailable(format!("{} {}: {}", action, path.display(), error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        let token = backend.try_lock("player_1", TTL).await.unwrap();
        backend
            .save("player_1", token, &json!({"coins": 50}))
            .await
            .unwrap();
        backend.unlock("player_1", token).await.unwrap();

        let reopened = FileBackend::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.load("player_1").await.unwrap(),
            Some(json!({"coins": 50}))
        );
        assert_eq!(reopened.load("player_2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lock_file_excludes_second_owner() {
        let dir = TempDir::new().unwrap();
        let first = FileBackend::open(dir.path()).await.unwrap();
        let second = FileBackend::open(dir.path()).await.unwrap();

        let token = first.try_lock("p1", TTL).await.unwrap();
        assert_eq!(
            second.try_lock("p1", TTL).await,
            Err(BackendError::AlreadyLocked)
        );
        assert_eq!(
            second.save("p1", LockToken::new(), &json!({})).await,
            Err(BackendError::LockNotHeld)
        );

        first.refresh_lock("p1", token, TTL).await.unwrap();
        first.unlock("p1", token).await.unwrap();
        assert!(second.try_lock("p1", TTL).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lock_file_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();

        let stale = backend.try_lock("p1", Duration::ZERO).await.unwrap();
        let fresh = backend.try_lock("p1", TTL).await.unwrap();

        assert_ne!(stale, fresh);
        assert_eq!(
            backend.unlock("p1", stale).await,
            Err(BackendError::LockNotHeld)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn abandoned_lock_has_one_new_owner() {
        let dir = TempDir::new().unwrap();
        let original = FileBackend::open(dir.path()).await.unwrap();
        let stale = original.try_lock("p1", Duration::ZERO).await.unwrap();

        let contenders: Vec<_> = (0..6)
            .map(|_| {
                let root = dir.path().to_path_buf();
                tokio::spawn(async move {
                    let backend = FileBackend::open(root).await.unwrap();
                    backend.try_lock("p1", TTL).await
                })
            })
            .collect();

        let mut winners = Vec::new();
        for contender in contenders {
            match contender.await.unwrap() {
                Ok(token) => winners.push(token),
                Err(e) => assert_eq!(e, BackendError::AlreadyLocked),
            }
        }
        assert_eq!(winners.len(), 1);

        let winner = winners[0];
        assert_eq!(
            original.save("p1", stale, &json!({"coins": 1})).await,
            Err(BackendError::LockNotHeld)
        );
        original
            .save("p1", winner, &json!({"coins": 2}))
            .await
            .unwrap();
        assert_eq!(original.load("p1").await.unwrap(), Some(json!({"coins": 2})));
        assert!(!original.guard_path("p1").exists());
    }

    #[tokio::test]
    async fn orphaned_guard_does_not_block_forever() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        let guard = backend.guard_path("p1");
        std::fs::write(&guard, b"").unwrap();
        let old = SystemTime::now() - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&guard)
            .unwrap()
            .set_modified(old)
            .unwrap();

        assert!(backend.try_lock("p1", TTL).await.is_ok());
        assert!(!guard.exists());
    }

    #[tokio::test]
    async fn corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        tokio::fs::write(backend.record_path("p1"), b"{not json")
            .await
            .unwrap();

        assert!(matches!(
            backend.load("p1").await,
            Err(BackendError::Corrupt(_))
        ));
    }

    #[test]
    fn keys_are_escaped() {
        assert_eq!(encode_key("player_42"), "player_42");
        assert_eq!(encode_key("a/b c"), "a~2Fb~20c");
    }
}
