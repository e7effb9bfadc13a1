//! The seam between the server and whatever transport carries its messages.
//!
//! The server never touches bytes or sockets. Outbound traffic goes through a
//! [`RemoteChannel`]; inbound traffic arrives as [`ChannelEvent`]s on an mpsc
//! receiver handed to [`GameServer::run`](crate::GameServer::run).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use unit_system::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    Connection(ConnectionId),
    /// The remote side as a whole, e.g. for the phase 1 ready signal.
    Peer,
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Attached(ConnectionId),
    Message {
        connection: ConnectionId,
        event: String,
        payload: Value,
    },
    Detached(ConnectionId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("no route to {0:?}")]
    UnknownRecipient(Recipient),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Outbound half of the transport.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn send(
        &self,
        recipient: Recipient,
        event_name: &str,
        payload: &Value,
    ) -> Result<(), ChannelError>;

    /// Asks the transport to drop a connection. It reports back with
    /// [`ChannelEvent::Detached`] once it has.
    async fn disconnect(&self, connection: ConnectionId, reason: &str)
        -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub recipient: Recipient,
    pub event: String,
    pub payload: Value,
}

/// In-memory channel: records what the server sends and lets the caller
/// inject inbound events.
///
/// `disconnect` is looped back as a [`ChannelEvent::Detached`], like a real
/// transport closing the socket.
pub struct LoopbackChannel {
    inbound: mpsc::Sender<ChannelEvent>,
    sent: Mutex<Vec<OutboundMessage>>,
    disconnects: Mutex<Vec<(ConnectionId, String)>>,
}

impl LoopbackChannel {
    /// Creates the channel and the receiver to hand to the server.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (inbound, receiver) = mpsc::channel(capacity);
        let channel = Self {
            inbound,
            sent: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        };
        (channel, receiver)
    }

    pub async fn inject(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        self.inbound.send(event).await.map_err(|_| ChannelError::Closed)
    }

    pub async fn attach(&self, connection: ConnectionId) -> Result<(), ChannelError> {
        self.inject(ChannelEvent::Attached(connection)).await
    }

    pub async fn message(
        &self,
        connection: ConnectionId,
        event: &str,
        payload: Value,
    ) -> Result<(), ChannelError> {
        self.inject(ChannelEvent::Message {
            connection,
            event: event.to_string(),
            payload,
        })
        .await
    }

    pub async fn detach(&self, connection: ConnectionId) -> Result<(), ChannelError> {
        self.inject(ChannelEvent::Detached(connection)).await
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, recipient: Recipient) -> Vec<OutboundMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.recipient == recipient)
            .collect()
    }

    pub fn disconnects(&self) -> Vec<(ConnectionId, String)> {
        self.disconnects
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteChannel for LoopbackChannel {
    async fn send(
        &self,
        recipient: Recipient,
        event_name: &str,
        payload: &Value,
    ) -> Result<(), ChannelError> {
        debug!("Loopback send {} to {:?}", event_name, recipient);
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| ChannelError::Transport("outbound log poisoned".to_string()))?;
        sent.push(OutboundMessage {
            recipient,
            event: event_name.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn disconnect(
        &self,
        connection: ConnectionId,
        reason: &str,
    ) -> Result<(), ChannelError> {
        {
            let mut disconnects = self
                .disconnects
                .lock()
                .map_err(|_| ChannelError::Transport("disconnect log poisoned".to_string()))?;
            disconnects.push((connection, reason.to_string()));
        }
        // try_send: the server's run loop may itself be the caller.
        self.inbound
            .try_send(ChannelEvent::Detached(connection))
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_outbound_and_loops_back_disconnects() {
        let (channel, mut inbound) = LoopbackChannel::new(8);
        let id = ConnectionId(7);

        channel
            .send(Recipient::Connection(id), "welcome", &json!({"motd": "hi"}))
            .await
            .unwrap();
        channel.send(Recipient::Peer, "client_ready", &json!({})).await.unwrap();
        channel.disconnect(id, "no session").await.unwrap();

        assert_eq!(channel.sent().len(), 2);
        assert_eq!(channel.sent_to(Recipient::Peer)[0].event, "client_ready");
        assert_eq!(channel.disconnects(), vec![(id, "no session".to_string())]);
        assert_eq!(inbound.recv().await, Some(ChannelEvent::Detached(id)));
    }
}
