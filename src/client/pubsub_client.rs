//! Client representation
//!
//! `MessageClient` is the broker's handle on a connected client: its id, a
//! way to push a server envelope to it and a way to ask it to disconnect.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::ServerEnvelope;
use crate::utils::error::{CloseReason, FatalError};

pub type ClientId = Uuid;

#[async_trait]
pub trait MessageClient: Send + Sync {
    fn id(&self) -> ClientId;

    /// Queues `envelope` for the client. Waits while the client's outbound
    /// capacity is exhausted.
    async fn send_message(&self, envelope: ServerEnvelope) -> Result<(), FatalError>;

    /// Asks the client to disconnect. Only the first request's reason is kept.
    async fn disconnect(&self, reason: CloseReason);
}

/// A client whose outbound side is a bounded channel.
#[derive(Debug)]
pub struct ChannelClient {
    id: ClientId,
    sender: mpsc::Sender<ServerEnvelope>,
    disconnected: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl ChannelClient {
    /// Creates a client with a fresh id and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let client = Self {
            id: Uuid::new_v4(),
            sender,
            disconnected: CancellationToken::new(),
            close_reason: Mutex::new(None),
        };
        (client, receiver)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl MessageClient for ChannelClient {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn send_message(&self, envelope: ServerEnvelope) -> Result<(), FatalError> {
        tokio::select! {
            biased;
            _ = self.disconnected.cancelled() => Err(FatalError::internal("client disconnected")),
            sent = self.sender.send(envelope) => {
                sent.map_err(|_| FatalError::internal("client channel closed"))
            }
        }
    }

    async fn disconnect(&self, reason: CloseReason) {
        {
            let mut close_reason = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
            if close_reason.is_none() {
                *close_reason = Some(reason);
            }
        }
        self.disconnected.cancel();
    }
}
