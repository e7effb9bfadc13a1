//! # Hearth Event System
//!
//! In-process, string-keyed publish/subscribe used by units that must not depend
//! on each other directly.
//!
//! ## Delivery model
//!
//! - Handlers for one event name are invoked in subscription order.
//! - Delivery is synchronous on the publishing task; nothing is deferred or spawned.
//! - A handler that returns an error (or panics) is logged and skipped; the
//!   remaining handlers still run and the publisher never sees the failure.
//! - Payloads travel as JSON. The bus does not validate their shape, producers and
//!   consumers agree on it out of band. [`NamedEvent`] binds a payload type to its
//!   event name so in-process code gets that agreement checked by the compiler.
//!
//! ## Event keys
//!
//! Raw names go through [`EventSystem::subscribe`] / [`EventSystem::publish`].
//! The namespaced helpers build keys the same way everywhere:
//!
//! - `core:<event>` for lifecycle events raised by the server itself
//! - `unit:<unit>:<event>` for unit-to-unit traffic
//!
//! ```rust,no_run
//! use hearth_event_system::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct CoinsChanged {
//!     player: u64,
//!     coins: i64,
//! }
//!
//! # async fn demo() -> Result<(), EventError> {
//! let events = create_event_system();
//! let handle = events
//!     .on_unit("CurrencyService", "coins_changed", |event: CoinsChanged| {
//!         println!("{} now has {} coins", event.player, event.coins);
//!         Ok(())
//!     })
//!     .await;
//!
//! events
//!     .emit_unit("CurrencyService", "coins_changed", &CoinsChanged { player: 7, coins: 50 })
//!     .await?;
//! events.unsubscribe(&handle).await;
//! # Ok(())
//! # }
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::sync::Arc;

mod system;

pub use system::{EventSystem, EventSystemStats, SubscriptionHandle};

// ============================================================================
// Event traits
// ============================================================================

/// A payload that can travel over the bus.
///
/// Implemented automatically for every `Serialize + DeserializeOwned` type.
pub trait Event: Send + Sync + Any + std::fmt::Debug {
    /// Stable type name used in handler names and log lines.
    fn type_name() -> &'static str
    where
        Self: Sized;

    fn serialize(&self) -> Result<Vec<u8>, EventError>;

    fn deserialize(data: &[u8]) -> Result<Self, EventError>
    where
        Self: Sized;
}

impl<T> Event for T
where
    T: Serialize + DeserializeOwned + Send + Sync + Any + std::fmt::Debug + 'static,
{
    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn serialize(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(EventError::Serialization)
    }

    fn deserialize(data: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(data).map_err(EventError::Deserialization)
    }
}

/// An event whose bus name is fixed by its type.
///
/// ```rust
/// use hearth_event_system::NamedEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct PlayerKicked { player: u64 }
///
/// impl NamedEvent for PlayerKicked {
///     const NAME: &'static str = "core:player_kicked";
/// }
/// ```
pub trait NamedEvent: Event + Sized {
    /// Full event key, including any namespace prefix.
    const NAME: &'static str;
}

/// Type-erased handler stored by the event system.
pub trait EventHandler: Send + Sync {
    /// Handles one serialized payload.
    fn handle(&self, data: &[u8]) -> Result<(), EventError>;

    /// Human-readable name used when a failure is logged.
    fn handler_name(&self) -> &str;
}

/// Adapts a closure over a concrete event type to [`EventHandler`].
pub struct TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    handler: F,
    name: String,
    _phantom: std::marker::PhantomData<fn(T)>,
}

impl<T, F> TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    pub fn new(name: String, handler: F) -> Self {
        Self {
            handler,
            name,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T, F> EventHandler for TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    fn handle(&self, data: &[u8]) -> Result<(), EventError> {
        let event = T::deserialize(data)?;
        (self.handler)(event)
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while publishing or handling events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The payload could not be turned into JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    /// A handler received a payload that does not match its type.
    #[error("Deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
    /// A handler reported a failure of its own.
    #[error("Handler execution error: {0}")]
    HandlerExecution(String),
    /// A handler panicked while running.
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
}

/// Creates a shareable event system with no subscriptions.
pub fn create_event_system() -> Arc<EventSystem> {
    Arc::new(EventSystem::new())
}

/// Current Unix time in milliseconds, used as the timestamp of lifecycle events.
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
