//! # Session Store
//!
//! Exclusive, auto-saving sessions over a durable key/value backend.
//!
//! A [`Session`] is a lease on one key: while it is live no other process can
//! acquire the same key, because every acquisition goes through the backend lock.
//! The lock expires after [`SessionStoreConfig::lock_timeout`] unless refreshed, so
//! a crashed owner never blocks a key forever; the auto-save worker of a live
//! session refreshes it on every tick.
//!
//! ## Lifecycle
//!
//! 1. [`SessionStore::acquire`] takes the lock (waiting up to `lock_wait` when it
//!    is contended), loads the stored blob or starts from the template, and
//!    [`reconcile`]s the two.
//! 2. Units mutate the blob through [`Session::update`], which marks it dirty.
//! 3. The auto-save worker flushes dirty data every `autosave_interval`.
//! 4. [`SessionStore::release`] flushes, stops the worker and unlocks. Releasing
//!    twice is a no-op.
//!
//! Backend calls that fail with [`BackendError::Unavailable`] are retried with
//! jittered exponential backoff (see [`RetryPolicy`]); when retries run out the
//! caller receives a [`SessionError`] it has to handle.

pub mod backend;
mod error;
mod reconcile;
mod retry;
mod session;
mod store;

pub use backend::{
    BackendCallCounts, BackendError, FileBackend, LockToken, MemoryBackend, StorageBackend,
};
pub use error::SessionError;
pub use reconcile::reconcile;
pub use retry::{BackendFailure, RetryPolicy};
pub use session::{Session, SessionState};
pub use store::{SessionStore, SessionStoreConfig};
