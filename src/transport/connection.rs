//! Connection handler
//!
//! Owns one client's lifecycle on top of a [`TransportPipe`]:
//!
//! `Accepted -> Registered -> Running -> Closing -> Closed`
//!
//! The handler registers with the broker (which greets the client), runs the
//! pipe with inbound envelopes routed to the broker, and on any ending
//! unregisters, closes the socket with the status the ending calls for and
//! releases the pipe. The broker talks back to the client through the
//! [`MessageClient`] implementation, which writes into the pipe and reports
//! each envelope to the broker once it has been written to the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::client::{ClientId, MessageClient};
use crate::protocol::{Envelope, ServerEnvelope};
use crate::transport::buffer::UnitCallback;
use crate::transport::pipe::{PipeOptions, TransportPipe};
use crate::transport::socket::WebSocket;
use crate::utils::error::{CloseReason, FatalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Registered,
    Running,
    Closing,
    Closed,
}

pub struct Connection {
    id: ClientId,
    broker: Arc<Broker>,
    pipe: TransportPipe,
    cancel: CancellationToken,
    state: Mutex<ConnectionState>,
    disconnect_reason: Mutex<Option<CloseReason>>,
    closed: AtomicBool,
}

impl Connection {
    /// Creates a handler with a fresh client id. Cancelling `shutdown` ends
    /// the connection with a normal closure.
    pub fn new(broker: Arc<Broker>, options: PipeOptions, shutdown: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            broker,
            pipe: TransportPipe::new(options),
            cancel: shutdown.child_token(),
            state: Mutex::new(ConnectionState::Accepted),
            disconnect_reason: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Drives the connection until it ends. Returns the error that ended it,
    /// if any; the socket has been closed (or aborted) by then.
    pub async fn handle(self: Arc<Self>, socket: Arc<dyn WebSocket>) -> Result<(), FatalError> {
        let client: Arc<dyn MessageClient> = self.clone();
        let (registered, outcome) = match self.broker.register_client(client).await {
            Ok(true) => {
                self.set_state(ConnectionState::Registered);
                (true, self.clone().run(socket.clone()).await)
            }
            Ok(false) => (
                false,
                Err(FatalError::internal(format!("client {} is already registered", self.id))),
            ),
            Err(e) => {
                warn!("Failed to greet client {}: {e}", self.id);
                (true, Err(e))
            }
        };

        self.close(socket.as_ref(), registered, &outcome).await;
        outcome
    }

    async fn run(self: Arc<Self>, socket: Arc<dyn WebSocket>) -> Result<(), FatalError> {
        self.set_state(ConnectionState::Running);
        debug!("Client {} running", self.id);

        let connection = Arc::clone(&self);
        let on_message = move |envelope: Envelope| {
            let connection = Arc::clone(&connection);
            async move { connection.dispatch(envelope).await }
        };
        self.pipe.run(socket, on_message, self.cancel.clone()).await
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<(), FatalError> {
        match envelope {
            Envelope::Client(envelope) => self
                .broker
                .handle_message(self, envelope)
                .await
                .map_err(FatalError::from),
            Envelope::Server(_) => Err(FatalError::protocol("expected a client envelope")),
        }
    }

    async fn close(&self, socket: &dyn WebSocket, registered: bool, outcome: &Result<(), FatalError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.cancel.cancel();

        if registered {
            self.broker.unregister_client(self.id);
        }

        let reason = match outcome {
            Err(e) => {
                warn!("Client {} failed: {e}", self.id);
                CloseReason::from(e)
            }
            Ok(()) => lock(&self.disconnect_reason)
                .clone()
                .unwrap_or_else(CloseReason::normal),
        };

        if socket.is_open() {
            if let Err(e) = socket.close(&reason).await {
                debug!("Close handshake with {} failed, aborting: {e}", self.id);
                socket.abort();
            }
        } else {
            socket.abort();
        }

        self.pipe.dispose();
        self.set_state(ConnectionState::Closed);
        info!(
            "Client {} closed ({}, {:?})",
            self.id,
            u16::from(reason.code),
            reason.reason
        );
    }
}

#[async_trait]
impl MessageClient for Connection {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn send_message(&self, envelope: ServerEnvelope) -> Result<(), FatalError> {
        let broker = self.broker.clone();
        let id = self.id;
        let sent = envelope.clone();
        let on_written: UnitCallback = Box::new(move || broker.notify_message_sent(id, &sent));
        self.pipe
            .send_then(&Envelope::Server(envelope), Some(on_written))
            .await
    }

    async fn disconnect(&self, reason: CloseReason) {
        {
            let mut stored = lock(&self.disconnect_reason);
            if stored.is_none() {
                *stored = Some(reason);
            }
        }
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
