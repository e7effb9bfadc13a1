//! # Game Server - Lifecycle Orchestration
//!
//! Brings a fixed set of service units up in a deterministic order at process
//! start, brings the matching per-connection initialization up once each
//! remote peer signals it is ready, and makes sure every connection's
//! persisted state is owned by exactly one process at a time.
//!
//! The server contains no game logic and no transport. Game logic lives in
//! units ([`unit_system::Unit`]); bytes travel over whatever implements
//! [`RemoteChannel`].
//!
//! ## Architecture Overview
//!
//! * **Lifecycle Orchestrator** ([`LifecycleOrchestrator`]) - phase 1 at start,
//!   phase 2 per connection, teardown on detach
//! * **Connection Manager** ([`ConnectionManager`]) - per-connection state,
//!   generations and chain workers
//! * **Persistence unit** ([`PersistenceService`]) - acquires each connection's
//!   session before any other unit runs
//! * **Event bus** - lifecycle events under `core:`, inbound client messages
//!   under `client:<event>`
//!
//! ### Connection flow
//!
//! 1. The transport reports `Attached(id)`; the connection awaits its handshake
//! 2. The client sends the handshake event (default `client_ready`)
//! 3. Server units run `connection_init` in priority order, persistence first
//! 4. The connection is `Ready`; `core:connection_ready` is published
//! 5. On `Detached(id)` the chain is cancelled and the session released
//!
//! ## Error Handling
//!
//! Unit failures never stop other units: they are logged, published as
//! `core:unit_init_failed` and collected in the [`StartupReport`]. Only a unit
//! name collision ([`ServerError::Registry`]) aborts startup.

pub use channel::{
    ChannelError, ChannelEvent, LoopbackChannel, OutboundMessage, Recipient, RemoteChannel,
};
pub use config::{ServerConfig, SessionFailurePolicy};
pub use connection::{ConnectionInfo, ConnectionManager, ConnectionState};
pub use context::ServerContextImpl;
pub use error::ServerError;
pub use lifecycle::{LifecycleOrchestrator, StartupPhase, StartupReport, UnitFailure};
pub use persistence::{PersistenceService, PERSISTENCE_PRIORITY};
pub use server::GameServer;

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod persistence;
pub mod server;

mod connection;
mod context;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConnectionAttachedEvent;
    use serde_json::json;
    use session_store::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use unit_system::{ConnectionId, UnitRegistry};

    fn server_with_loopback() -> (
        GameServer,
        Arc<LoopbackChannel>,
        tokio::sync::mpsc::Receiver<ChannelEvent>,
    ) {
        let (channel, inbound) = LoopbackChannel::new(16);
        let channel = Arc::new(channel);
        let mut registry = UnitRegistry::default();
        registry.declare(Arc::new(PersistenceService::new(json!({"coins": 0}))));
        let server = GameServer::new(
            ServerConfig::default(),
            registry,
            Arc::new(MemoryBackend::new()),
            channel.clone(),
        );
        (server, channel, inbound)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_core_events_reach_subscribers() {
        let (server, channel, inbound) = server_with_loopback();
        let events = server.get_event_system();

        let attached = Arc::new(AtomicUsize::new(0));
        let counter = attached.clone();
        events
            .on_core("connection_attached", move |event: ConnectionAttachedEvent| {
                assert_eq!(event.connection, ConnectionId(3));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let stopper = server.shutdown_handle();
        let driver = async {
            channel.attach(ConnectionId(3)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = stopper.send(());
        };
        let (report, ()) = tokio::join!(server.run(inbound), driver);

        assert!(report.unwrap().is_clean());
        assert_eq!(attached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_client_messages_are_republished() {
        let (server, channel, inbound) = server_with_loopback();
        let events = server.get_event_system();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        events
            .subscribe("client:chat", move |event: crate::events::InboundMessageEvent| {
                assert_eq!(event.payload, json!({"text": "hello"}));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let stopper = server.shutdown_handle();
        let driver = async {
            channel.attach(ConnectionId(1)).await.unwrap();
            channel
                .message(ConnectionId(1), "chat", json!({"text": "hello"}))
                .await
                .unwrap();
            // Unknown connection: dropped.
            channel
                .message(ConnectionId(2), "chat", json!({"text": "hello"}))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = stopper.send(());
        };
        let (report, ()) = tokio::join!(server.run(inbound), driver);

        assert!(report.is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_is_refused() {
        let (server, _channel, _inbound) = server_with_loopback();
        server.orchestrator().start().await.unwrap();

        assert!(matches!(
            server.orchestrator().start().await,
            Err(ServerError::AlreadyStarted)
        ));
    }
}
