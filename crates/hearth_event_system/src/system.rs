use crate::{Event, EventError, EventHandler, NamedEvent, TypedEventHandler};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, trace};

/// A handler together with the id its subscription handle refers to.
#[derive(Clone)]
struct Registered {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

/// Returned by every subscription; pass it to [`EventSystem::unsubscribe`] to cancel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    event_key: String,
    id: u64,
}

impl SubscriptionHandle {
    /// The full key this subscription listens on.
    pub fn event_key(&self) -> &str {
        &self.event_key
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct EventSystemStats {
    /// Handlers currently subscribed.
    pub total_handlers: usize,
    /// Publishes that reached at least one handler.
    pub events_emitted: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
}

/// Named publish/subscribe hub shared as `Arc<EventSystem>`.
pub struct EventSystem {
    handlers: RwLock<HashMap<String, Vec<Registered>>>,
    stats: RwLock<EventSystemStats>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSystem")
            .field("handlers", &"[handlers]")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventSystem {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventSystemStats::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribes `handler` to a raw event name.
    pub async fn subscribe<T, F>(&self, event_name: &str, handler: F) -> SubscriptionHandle
    where
        T: Event + 'static,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.register_typed_handler(event_name.to_string(), handler)
            .await
    }

    /// Subscribes to a lifecycle event raised by the server (`core:<event>`).
    pub async fn on_core<T, F>(&self, event_name: &str, handler: F) -> SubscriptionHandle
    where
        T: Event + 'static,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.register_typed_handler(format!("core:{}", event_name), handler)
            .await
    }

    /// Subscribes to an event published by another unit (`unit:<unit>:<event>`).
    pub async fn on_unit<T, F>(
        &self,
        unit_name: &str,
        event_name: &str,
        handler: F,
    ) -> SubscriptionHandle
    where
        T: Event + 'static,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.register_typed_handler(format!("unit:{}:{}", unit_name, event_name), handler)
            .await
    }

    /// Subscribes to a [`NamedEvent`]; the key comes from the type.
    pub async fn on_typed<E, F>(&self, handler: F) -> SubscriptionHandle
    where
        E: NamedEvent + 'static,
        F: Fn(E) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.register_typed_handler(E::NAME.to_string(), handler)
            .await
    }

    /// Cancels a subscription. Returns `false` if it was already gone.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = {
            let mut handlers = self.handlers.write().await;
            let Some(list) = handlers.get_mut(&handle.event_key) else {
                return false;
            };
            let before = list.len();
            list.retain(|registered| registered.id != handle.id);
            let removed = list.len() != before;
            if list.is_empty() {
                handlers.remove(&handle.event_key);
            }
            removed
        };

        if removed {
            let mut stats = self.stats.write().await;
            stats.total_handlers = stats.total_handlers.saturating_sub(1);
            debug!("Unsubscribed handler {} from {}", handle.id, handle.event_key);
        }
        removed
    }

    /// Publishes `event` under a raw event name.
    pub async fn publish<T>(&self, event_name: &str, event: &T) -> Result<(), EventError>
    where
        T: Event,
    {
        self.emit_event(event_name, event).await
    }

    /// Publishes a lifecycle event (`core:<event>`).
    pub async fn emit_core<T>(&self, event_name: &str, event: &T) -> Result<(), EventError>
    where
        T: Event,
    {
        self.emit_event(&format!("core:{}", event_name), event).await
    }

    /// Publishes a unit event (`unit:<unit>:<event>`).
    pub async fn emit_unit<T>(
        &self,
        unit_name: &str,
        event_name: &str,
        event: &T,
    ) -> Result<(), EventError>
    where
        T: Event,
    {
        self.emit_event(&format!("unit:{}:{}", unit_name, event_name), event)
            .await
    }

    /// Publishes a [`NamedEvent`] under its own key.
    pub async fn emit_typed<E>(&self, event: &E) -> Result<(), EventError>
    where
        E: NamedEvent,
    {
        self.emit_event(E::NAME, event).await
    }

    /// Number of handlers currently subscribed to `event_key`.
    pub async fn handler_count(&self, event_key: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn get_stats(&self) -> EventSystemStats {
        self.stats.read().await.clone()
    }

    async fn register_typed_handler<T, F>(&self, event_key: String, handler: F) -> SubscriptionHandle
    where
        T: Event + 'static,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler_name = format!("{}::{}#{}", event_key, T::type_name(), id);
        let handler: Arc<dyn EventHandler> = Arc::new(TypedEventHandler::new(handler_name, handler));

        self.handlers
            .write()
            .await
            .entry(event_key.clone())
            .or_default()
            .push(Registered { id, handler });

        self.stats.write().await.total_handlers += 1;

        debug!("📝 Registered handler {} for {}", id, event_key);
        SubscriptionHandle { event_key, id }
    }

    /// Serializes once, then runs every handler in order on the calling task.
    async fn emit_event<T>(&self, event_key: &str, event: &T) -> Result<(), EventError>
    where
        T: Event,
    {
        let data = event.serialize()?;

        // Snapshot so handlers never run under the registry lock.
        let snapshot: Vec<Registered> = match self.handlers.read().await.get(event_key) {
            Some(list) => list.clone(),
            None => {
                trace!("No handlers for event: {}", event_key);
                return Ok(());
            }
        };

        debug!("📤 Emitting {} to {} handlers", event_key, snapshot.len());

        let mut failures = 0u64;
        for registered in &snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| registered.handler.handle(&data)))
                .unwrap_or_else(|panic| Err(EventError::HandlerPanicked(panic_message(&*panic))));

            if let Err(e) = outcome {
                failures += 1;
                error!("❌ Handler {} failed: {}", registered.handler.handler_name(), e);
            }
        }

        let mut stats = self.stats.write().await;
        stats.events_emitted += 1;
        stats.handler_failures += failures;
        Ok(())
    }
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_event_system;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestEvent {
        message: String,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Typed {
        value: u32,
    }

    impl NamedEvent for Typed {
        const NAME: &'static str = "core:typed";
    }

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn delivers_in_subscription_order() {
        let events = create_event_system();
        let seen = recorder();

        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            events
                .subscribe("ordered", move |event: TestEvent| {
                    seen.lock().unwrap().push(format!("{}:{}", label, event.message));
                    Ok(())
                })
                .await;
        }

        events
            .publish("ordered", &TestEvent { message: "hi".into() })
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:hi", "second:hi", "third:hi"]
        );
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_healthy_ones() {
        let events = create_event_system();
        let seen = recorder();

        let first = seen.clone();
        events
            .subscribe("faulty", move |_: TestEvent| {
                first.lock().unwrap().push("healthy-1".into());
                Ok(())
            })
            .await;
        events
            .subscribe("faulty", |_: TestEvent| {
                Err(EventError::HandlerExecution("boom".into()))
            })
            .await;
        events
            .subscribe("faulty", |_: TestEvent| -> Result<(), EventError> {
                panic!("handler exploded")
            })
            .await;
        let last = seen.clone();
        events
            .subscribe("faulty", move |_: TestEvent| {
                last.lock().unwrap().push("healthy-2".into());
                Ok(())
            })
            .await;

        let result = events
            .publish("faulty", &TestEvent { message: "x".into() })
            .await;

        assert!(result.is_ok());
        assert_eq!(*seen.lock().unwrap(), vec!["healthy-1", "healthy-2"]);
        assert_eq!(events.get_stats().await.handler_failures, 2);
    }

    #[tokio::test]
    async fn mismatched_payload_is_a_handler_failure() {
        let events = create_event_system();
        events.subscribe("shape", |_: Typed| Ok(())).await;

        events
            .publish("shape", &TestEvent { message: "not a number".into() })
            .await
            .unwrap();

        assert_eq!(events.get_stats().await.handler_failures, 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let events = create_event_system();
        let seen = recorder();

        let kept = seen.clone();
        events
            .on_core("tick", move |_: TestEvent| {
                kept.lock().unwrap().push("kept".into());
                Ok(())
            })
            .await;
        let dropped = seen.clone();
        let handle = events
            .on_core("tick", move |_: TestEvent| {
                dropped.lock().unwrap().push("dropped".into());
                Ok(())
            })
            .await;

        assert_eq!(handle.event_key(), "core:tick");
        assert!(events.unsubscribe(&handle).await);
        assert!(!events.unsubscribe(&handle).await);

        events
            .emit_core("tick", &TestEvent { message: "t".into() })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["kept"]);
        assert_eq!(events.get_stats().await.total_handlers, 1);
    }

    #[tokio::test]
    async fn unit_and_typed_keys() {
        let events = create_event_system();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let typed = seen.clone();
        events
            .on_typed(move |event: Typed| {
                typed.lock().unwrap().push(event.value);
                Ok(())
            })
            .await;
        events
            .on_unit("CurrencyService", "changed", |_: TestEvent| Ok(()))
            .await;

        events.emit_typed(&Typed { value: 42 }).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![42]);
        assert_eq!(events.handler_count("unit:CurrencyService:changed").await, 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let events = create_event_system();
        events
            .publish("nobody", &TestEvent { message: "void".into() })
            .await
            .unwrap();
        assert_eq!(events.get_stats().await.events_emitted, 0);
    }
}
