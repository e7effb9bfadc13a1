/// Failures surfaced to callers of the session store.
///
/// None of these are swallowed: a caller that gets an error has no session and
/// must not touch player data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Another owner still holds the key after waiting `lock_wait`.
    #[error("session {key} is locked by another owner")]
    AlreadyLocked { key: String },

    /// The backend kept failing until the retry policy gave up.
    #[error("backend unavailable for {key} after {attempts} attempt(s): {message}")]
    BackendUnavailable {
        key: String,
        attempts: u32,
        message: String,
    },

    /// The backend lock now belongs to someone else; this session can no longer write.
    #[error("session {key} lost its lock")]
    LockLost { key: String },

    /// The session was released and no longer accepts writes.
    #[error("session {key} has been released")]
    Released { key: String },

    /// The stored blob could not be decoded.
    #[error("stored data for {key} is corrupt: {message}")]
    CorruptData { key: String, message: String },
}

impl SessionError {
    pub fn key(&self) -> &str {
        match self {
            SessionError::AlreadyLocked { key }
            | SessionError::BackendUnavailable { key, .. }
            | SessionError::LockLost { key }
            | SessionError::Released { key }
            | SessionError::CorruptData { key, .. } => key,
        }
    }
}
