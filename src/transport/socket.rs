//! Socket abstraction
//!
//! The transport pipe only needs a full-duplex socket that preserves message
//! boundaries: receive one frame, send one frame, close with a status, abort.
//! [`WebSocket`] captures that contract; [`TungsteniteSocket`] implements it
//! on top of an accepted `tokio-tungstenite` stream.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::Message as WsMessage;

use crate::utils::error::CloseReason;

const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Close,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Text => f.write_str("text"),
            FrameKind::Binary => f.write_str("binary"),
            FrameKind::Close => f.write_str("close"),
        }
    }
}

/// One received frame. `end_of_message` marks the last frame of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketFrame {
    pub kind: FrameKind,
    pub payload: Bytes,
    pub end_of_message: bool,
}

impl SocketFrame {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Text,
            payload: payload.into(),
            end_of_message: true,
        }
    }

    pub fn close() -> Self {
        Self {
            kind: FrameKind::Close,
            payload: Bytes::new(),
            end_of_message: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("connection closed without a close frame")]
    ConnectionReset,
    #[error("socket is closed")]
    Closed,
    #[error("outgoing text is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

#[async_trait]
pub trait WebSocket: Send + Sync + 'static {
    /// Receives the next frame.
    async fn receive(&self) -> Result<SocketFrame, SocketError>;

    /// Sends one frame of a message; the message is complete once a frame
    /// with `end_of_message` has been sent.
    async fn send(
        &self,
        payload: &[u8],
        kind: FrameKind,
        end_of_message: bool,
    ) -> Result<(), SocketError>;

    /// Graceful close handshake with the given status.
    async fn close(&self, reason: &CloseReason) -> Result<(), SocketError>;

    /// Abrupt teardown, used when a graceful close is impossible.
    fn abort(&self);

    fn is_open(&self) -> bool;
}

struct Outgoing<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
    partial: BytesMut,
}

/// [`WebSocket`] over an accepted `tokio-tungstenite` stream.
///
/// Ping/pong is answered by tungstenite itself. Fragments handed to
/// [`WebSocket::send`] are assembled until `end_of_message` and written as a
/// single text message.
pub struct TungsteniteSocket<S> {
    outgoing: Mutex<Outgoing<S>>,
    incoming: Mutex<SplitStream<WebSocketStream<S>>>,
    open: AtomicBool,
}

impl<S> TungsteniteSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = stream.split();
        Self {
            outgoing: Mutex::new(Outgoing {
                sink,
                partial: BytesMut::new(),
            }),
            incoming: Mutex::new(stream),
            open: AtomicBool::new(true),
        }
    }

    fn ensure_open(&self) -> Result<(), SocketError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SocketError::Closed)
        }
    }
}

#[async_trait]
impl<S> WebSocket for TungsteniteSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&self) -> Result<SocketFrame, SocketError> {
        self.ensure_open()?;
        let mut incoming = self.incoming.lock().await;
        loop {
            let msg = match incoming.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
                None => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(SocketError::ConnectionReset);
                }
            };
            let kind = match &msg {
                WsMessage::Text(_) => FrameKind::Text,
                WsMessage::Binary(_) => FrameKind::Binary,
                WsMessage::Close(_) => {
                    // tungstenite has queued the close reply, push it out
                    self.open.store(false, Ordering::SeqCst);
                    let _ = self.outgoing.lock().await.sink.flush().await;
                    return Ok(SocketFrame::close());
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            };
            return Ok(SocketFrame {
                kind,
                payload: msg.into_data(),
                end_of_message: true,
            });
        }
    }

    async fn send(
        &self,
        payload: &[u8],
        kind: FrameKind,
        end_of_message: bool,
    ) -> Result<(), SocketError> {
        self.ensure_open()?;
        let mut outgoing = self.outgoing.lock().await;
        outgoing.partial.extend_from_slice(payload);
        if !end_of_message {
            return Ok(());
        }

        let data = outgoing.partial.split().freeze();
        let msg = match kind {
            FrameKind::Text => WsMessage::text(String::from_utf8(data.to_vec())?),
            FrameKind::Binary => WsMessage::binary(data),
            FrameKind::Close => WsMessage::Close(None),
        };
        outgoing.sink.send(msg).await?;
        Ok(())
    }

    async fn close(&self, reason: &CloseReason) -> Result<(), SocketError> {
        self.ensure_open()?;
        self.open.store(false, Ordering::SeqCst);
        let frame = CloseFrame {
            code: reason.code,
            reason: reason.wire_reason().to_owned().into(),
        };
        self.outgoing
            .lock()
            .await
            .sink
            .send(WsMessage::Close(Some(frame)))
            .await?;

        // give the peer a moment to answer before the stream is dropped
        let mut incoming = self.incoming.lock().await;
        let _ = tokio::time::timeout(CLOSE_REPLY_TIMEOUT, async {
            while let Some(Ok(msg)) = incoming.next().await {
                if msg.is_close() {
                    break;
                }
            }
        })
        .await;
        Ok(())
    }

    fn abort(&self) {
        // The TCP stream is released when the owning handler drops the socket.
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
