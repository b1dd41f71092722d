//! Pipe buffer
//!
//! A bounded single-producer/single-consumer byte buffer. The writer appends
//! bytes in any number of partial writes and calls [`PipeBuffer::flush`] to
//! publish everything written so far as one unit; the reader receives whole
//! units, so the flush is the message boundary.
//!
//! Backpressure: `flush` waits while more than `capacity` bytes are
//! published but unread. A single unit larger than the capacity is still
//! accepted into an empty buffer, the writer then waits for it to drain.
//!
//! A unit may carry a [`UnitCallback`]. The reader takes it together with the
//! unit and decides when the unit counts as consumed; callbacks of units
//! that are never read are dropped without running.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::utils::error::FatalError;

pub const DEFAULT_CAPACITY: usize = 64 * 1024;

pub type UnitCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
pub enum ReadResult {
    /// One flushed unit.
    Unit(Bytes),
    /// The writer completed; carries the error it completed with, if any.
    Completed(Option<FatalError>),
    /// A pending read was cancelled.
    Cancelled,
}

#[derive(Default)]
struct BufferState {
    pending: BytesMut,
    units: VecDeque<(Bytes, Option<UnitCallback>)>,
    buffered: usize,
    writer_completed: bool,
    reader_completed: bool,
    read_cancelled: bool,
    error: Option<FatalError>,
}

pub struct PipeBuffer {
    state: Mutex<BufferState>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

impl PipeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn closed_error(state: &BufferState) -> FatalError {
        state
            .error
            .clone()
            .unwrap_or_else(|| FatalError::internal("pipe buffer is closed"))
    }

    /// Appends bytes to the unflushed tail.
    pub fn write(&self, data: &[u8]) -> Result<(), FatalError> {
        let mut state = self.lock();
        if state.writer_completed || state.reader_completed {
            return Err(Self::closed_error(&state));
        }
        state.pending.extend_from_slice(data);
        Ok(())
    }

    /// Drops bytes written since the last flush.
    pub fn discard_pending(&self) {
        self.lock().pending.clear();
    }

    /// Publishes the unflushed tail as one unit and applies backpressure.
    pub async fn flush(&self) -> Result<(), FatalError> {
        self.flush_with(None).await
    }

    /// Like [`PipeBuffer::flush`], attaching `on_consumed` to the published
    /// unit. Without pending bytes there is no unit and the callback is
    /// dropped.
    pub async fn flush_with(&self, on_consumed: Option<UnitCallback>) -> Result<(), FatalError> {
        {
            let mut state = self.lock();
            if state.writer_completed || state.reader_completed {
                return Err(Self::closed_error(&state));
            }
            if !state.pending.is_empty() {
                let unit = state.pending.split().freeze();
                state.buffered += unit.len();
                state.units.push_back((unit, on_consumed));
                self.readable.notify_waiters();
            }
        }

        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.reader_completed {
                    return Err(Self::closed_error(&state));
                }
                if state.buffered <= self.capacity {
                    return Ok(());
                }
                if state.writer_completed {
                    return Err(Self::closed_error(&state));
                }
            }
            notified.await;
        }
    }

    /// Waits for the next flushed unit.
    pub async fn read(&self) -> ReadResult {
        self.read_with_callback().await.0
    }

    /// Waits for the next flushed unit and hands out its callback.
    pub async fn read_with_callback(&self) -> (ReadResult, Option<UnitCallback>) {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.read_cancelled {
                    state.read_cancelled = false;
                    return (ReadResult::Cancelled, None);
                }
                if let Some((unit, on_consumed)) = state.units.pop_front() {
                    state.buffered -= unit.len();
                    self.writable.notify_waiters();
                    return (ReadResult::Unit(unit), on_consumed);
                }
                if state.writer_completed || state.reader_completed {
                    return (ReadResult::Completed(state.error.clone()), None);
                }
            }
            notified.await;
        }
    }

    /// Completes the writer side. The first completion wins; units already
    /// flushed stay readable, unflushed bytes are discarded.
    pub fn complete(&self, error: Option<FatalError>) {
        let mut state = self.lock();
        if !state.writer_completed {
            state.writer_completed = true;
            state.error = error;
            state.pending.clear();
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Completes the reader side; writers fail from now on.
    pub fn complete_reader(&self) {
        let mut state = self.lock();
        state.reader_completed = true;
        state.units.clear();
        state.buffered = 0;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Makes the current (or next) `read` return [`ReadResult::Cancelled`].
    pub fn cancel_pending_read(&self) {
        self.lock().read_cancelled = true;
        self.readable.notify_waiters();
    }

    pub fn is_completed(&self) -> bool {
        self.lock().writer_completed
    }

    /// Published bytes not yet read.
    pub fn buffered(&self) -> usize {
        self.lock().buffered
    }
}

impl Default for PipeBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
