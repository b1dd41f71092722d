//! In-memory [`WebSocket`] double for pipe and connection tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Envelope, ServerEnvelope, codec};
use crate::transport::socket::{FrameKind, SocketError, SocketFrame, WebSocket};
use crate::utils::error::CloseReason;

pub struct MemorySocket {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<SocketFrame>>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    partial: Mutex<BytesMut>,
    frames: Mutex<Vec<(usize, bool)>>,
    close_reason: Mutex<Option<CloseReason>>,
    open: AtomicBool,
    aborted: AtomicBool,
    stalled: AtomicBool,
    finished: CancellationToken,
}

/// The test's end of a [`MemorySocket`].
pub struct MemoryPeer {
    frames: mpsc::UnboundedSender<SocketFrame>,
    messages: mpsc::UnboundedReceiver<Bytes>,
}

impl MemorySocket {
    pub fn pair() -> (Arc<Self>, MemoryPeer) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self {
            incoming: tokio::sync::Mutex::new(frames_rx),
            outgoing: messages_tx,
            partial: Mutex::new(BytesMut::new()),
            frames: Mutex::new(Vec::new()),
            close_reason: Mutex::new(None),
            open: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            finished: CancellationToken::new(),
        });
        let peer = MemoryPeer {
            frames: frames_tx,
            messages: messages_rx,
        };
        (socket, peer)
    }

    /// Size and end-of-message flag of every frame sent so far.
    pub fn sent_frames(&self) -> Vec<(usize, bool)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().unwrap().clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Makes every later `send` hang, like a peer that stopped reading.
    pub fn stall_sends(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Waits until the socket is closed or aborted.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }
}

#[async_trait]
impl WebSocket for MemorySocket {
    async fn receive(&self) -> Result<SocketFrame, SocketError> {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(frame) => {
                if frame.kind == FrameKind::Close {
                    self.open.store(false, Ordering::SeqCst);
                }
                Ok(frame)
            }
            None => {
                self.open.store(false, Ordering::SeqCst);
                Err(SocketError::ConnectionReset)
            }
        }
    }

    async fn send(
        &self,
        payload: &[u8],
        _kind: FrameKind,
        end_of_message: bool,
    ) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.frames
            .lock()
            .unwrap()
            .push((payload.len(), end_of_message));
        let mut partial = self.partial.lock().unwrap();
        partial.extend_from_slice(payload);
        if end_of_message {
            let message = partial.split().freeze();
            self.outgoing
                .send(message)
                .map_err(|_| SocketError::ConnectionReset)?;
        }
        Ok(())
    }

    async fn close(&self, reason: &CloseReason) -> Result<(), SocketError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        *self.close_reason.lock().unwrap() = Some(reason.clone());
        self.finished.cancel();
        Ok(())
    }

    fn abort(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
        self.finished.cancel();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl MemoryPeer {
    pub fn send_frame(&self, frame: SocketFrame) {
        self.frames.send(frame).unwrap();
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let text: String = text.into();
        self.send_frame(SocketFrame::text(text));
    }

    pub fn send_envelope(&self, envelope: impl Into<Envelope>) {
        let bytes = codec::encode(&envelope.into()).unwrap();
        self.send_frame(SocketFrame::text(bytes));
    }

    pub fn send_close(&self) {
        self.send_frame(SocketFrame::close());
    }

    /// Next complete message the socket sent, raw.
    pub async fn recv_raw(&mut self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), self.messages.recv())
            .await
            .expect("timed out waiting for an outbound message")
            .expect("socket dropped")
    }

    pub async fn recv_envelope(&mut self) -> ServerEnvelope {
        match codec::decode(&self.recv_raw().await).unwrap() {
            Envelope::Server(envelope) => envelope,
            other => panic!("Expected a server envelope, got {other:?}"),
        }
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.messages.try_recv().ok()
    }
}
