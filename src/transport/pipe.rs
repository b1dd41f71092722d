//! Transport pipe
//!
//! Turns one socket into two independent streams of protocol objects. Three
//! loops run as separate tasks for the lifetime of [`TransportPipe::run`]:
//!
//! - fill: socket frames -> inbound buffer, one flush per complete message
//! - drain: inbound buffer -> decoded envelopes -> consumer callback
//! - outbound drain: outbound buffer -> socket frames, one unit per message
//!
//! [`TransportPipe::send`] serializes into the outbound buffer under a lock
//! and flushes, so every unit the outbound drain reads is exactly one
//! envelope. A unit can carry a callback that the outbound drain runs once
//! the unit's final frame has been written to the socket. The loops share a cancellation token; the first loop to finish
//! ends the run and the others are cancelled and joined.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::protocol::{Envelope, MAX_MESSAGE_SIZE, codec};
use crate::transport::buffer::{self, PipeBuffer, ReadResult, UnitCallback};
use crate::transport::socket::{FrameKind, WebSocket};
use crate::utils::error::FatalError;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// Published-but-unread bytes at which a flush starts waiting.
    pub buffer_capacity: usize,
    /// Largest socket frame emitted by the outbound drain.
    pub max_frame_size: usize,
    /// Largest inbound message the drain will accumulate.
    pub max_message_size: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: buffer::DEFAULT_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

pub struct TransportPipe {
    inbound: Arc<PipeBuffer>,
    outbound: Arc<PipeBuffer>,
    send_lock: Mutex<()>,
    options: PipeOptions,
    disposed: AtomicBool,
}

impl TransportPipe {
    pub fn new(options: PipeOptions) -> Self {
        Self {
            inbound: Arc::new(PipeBuffer::new(options.buffer_capacity)),
            outbound: Arc::new(PipeBuffer::new(options.buffer_capacity)),
            send_lock: Mutex::new(()),
            options,
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), FatalError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(FatalError::internal("transport pipe is disposed"));
        }
        Ok(())
    }

    /// Serializes `envelope` into the outbound buffer as one unit.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), FatalError> {
        self.send_then(envelope, None).await
    }

    /// Like [`TransportPipe::send`]; `on_written` runs after the last frame
    /// of the envelope reached the socket. It never runs if the pipe stops
    /// first.
    pub async fn send_then(
        &self,
        envelope: &Envelope,
        on_written: Option<UnitCallback>,
    ) -> Result<(), FatalError> {
        self.ensure_not_disposed()?;
        let _guard = self.send_lock.lock().await;

        let writer = BufferWriter(&self.outbound);
        if let Err(e) = serde_json::to_writer(writer, envelope) {
            self.outbound.discard_pending();
            return Err(FatalError::unhandled(e));
        }
        self.outbound.flush_with(on_written).await
    }

    /// Runs the fill, drain and outbound drain loops until the first of them
    /// finishes, then tears the others down.
    ///
    /// Returns `Ok(())` on cancellation or when the peer closes; any other
    /// ending is a [`FatalError`].
    pub async fn run<S, F, Fut>(
        &self,
        socket: Arc<S>,
        on_message: F,
        cancel: CancellationToken,
    ) -> Result<(), FatalError>
    where
        S: WebSocket + ?Sized,
        F: FnMut(Envelope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FatalError>> + Send + 'static,
    {
        self.ensure_not_disposed()?;
        let token = cancel.child_token();

        let mut tasks = JoinSet::new();
        tasks.spawn(fill_inbound(
            socket.clone(),
            self.inbound.clone(),
            token.clone(),
        ));
        tasks.spawn(drain_inbound(
            self.inbound.clone(),
            on_message,
            token.clone(),
            self.options.max_message_size,
        ));
        tasks.spawn(drain_outbound(
            socket,
            self.outbound.clone(),
            token.clone(),
            self.options.max_frame_size.max(1),
        ));

        let result = match tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(FatalError::unhandled(e)),
            None => Ok(()),
        };

        token.cancel();
        let failure = result.as_ref().err().cloned();
        self.inbound.complete(failure.clone());
        self.inbound.cancel_pending_read();
        self.outbound.complete(failure);
        self.outbound.cancel_pending_read();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(e)) => debug!("transport loop ended during teardown: {e}"),
                Err(e) if e.is_panic() => error!("transport loop panicked: {e}"),
                _ => {}
            }
        }

        result
    }

    /// Releases both buffers. Safe to call any number of times.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for buffer in [&self.inbound, &self.outbound] {
            buffer.complete(None);
            buffer.complete_reader();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for TransportPipe {
    fn default() -> Self {
        Self::new(PipeOptions::default())
    }
}

/// `io::Write` over the outbound buffer so serialization streams into it.
struct BufferWriter<'a>(&'a PipeBuffer);

impl io::Write for BufferWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .write(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

async fn fill_inbound<S>(
    socket: Arc<S>,
    inbound: Arc<PipeBuffer>,
    token: CancellationToken,
) -> Result<(), FatalError>
where
    S: WebSocket + ?Sized,
{
    let result = fill(&*socket, &inbound, &token).await;
    inbound.complete(result.as_ref().err().cloned());
    result
}

async fn fill<S>(
    socket: &S,
    inbound: &PipeBuffer,
    token: &CancellationToken,
) -> Result<(), FatalError>
where
    S: WebSocket + ?Sized,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            frame = socket.receive() => frame.map_err(FatalError::unhandled)?,
        };

        match frame.kind {
            FrameKind::Close => {
                debug!("peer sent a close frame");
                return Ok(());
            }
            FrameKind::Text => {}
            other => return Err(FatalError::invalid_message_type(other)),
        }

        inbound.write(&frame.payload)?;
        if frame.end_of_message {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                flushed = inbound.flush() => flushed?,
            }
        }
    }
}

async fn drain_inbound<F, Fut>(
    inbound: Arc<PipeBuffer>,
    mut on_message: F,
    token: CancellationToken,
    max_message_size: usize,
) -> Result<(), FatalError>
where
    F: FnMut(Envelope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), FatalError>> + Send + 'static,
{
    let mut pending = BytesMut::new();
    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            read = inbound.read() => read,
        };
        match read {
            ReadResult::Unit(unit) => pending.extend_from_slice(&unit),
            ReadResult::Completed(Some(e)) => return Err(e),
            ReadResult::Completed(None) | ReadResult::Cancelled => return Ok(()),
        }

        // one envelope at a time, in arrival order
        while let Some(envelope) = codec::decode_next(&mut pending).map_err(FatalError::decode)? {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                handled = on_message(envelope) => handled?,
            }
        }

        if pending.len() > max_message_size {
            return Err(FatalError::message_too_big(max_message_size));
        }
    }
}

async fn drain_outbound<S>(
    socket: Arc<S>,
    outbound: Arc<PipeBuffer>,
    token: CancellationToken,
    max_frame_size: usize,
) -> Result<(), FatalError>
where
    S: WebSocket + ?Sized,
{
    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            read = outbound.read_with_callback() => read,
        };
        let (read, on_written) = read;
        let unit = match read {
            ReadResult::Unit(unit) => unit,
            ReadResult::Completed(Some(e)) => return Err(e),
            ReadResult::Completed(None) | ReadResult::Cancelled => return Ok(()),
        };

        let mut frames = unit.chunks(max_frame_size).peekable();
        while let Some(frame) = frames.next() {
            let end_of_message = frames.peek().is_none();
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                sent = socket.send(frame, FrameKind::Text, end_of_message) => {
                    sent.map_err(FatalError::unhandled)?
                }
            }
        }
        if let Some(on_written) = on_written {
            on_written();
        }
    }
}
