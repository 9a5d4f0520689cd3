use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use super::session::SessionId;
use crate::{AppError, AppResult};

/// What [`SendEngine::enqueue`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The engine was idle; the caller must start driving the write.
    Started,
    /// A write is already in flight; the frame waits its turn.
    Queued,
}

/// What the driver does after a write completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// The current frame still has bytes left.
    Continue,
    /// The current frame is done and the next queued frame is now in flight.
    NextFrame,
    /// Nothing left to send; the engine is idle again.
    Idle,
}

#[derive(Debug, Default)]
struct SendState {
    connection: Option<SessionId>,
    writing: bool,
    bytes_to_send: Option<Bytes>,
    total_sent: usize,
    queue: VecDeque<Bytes>,
}

impl SendState {
    fn clear(&mut self) -> usize {
        let dropped = self.queue.len() + usize::from(self.bytes_to_send.is_some());
        self.writing = false;
        self.bytes_to_send = None;
        self.total_sent = 0;
        self.queue.clear();
        dropped
    }
}

/// Per-connection writer that keeps at most one frame in flight.
///
/// All transitions happen under one lock, so a submitter can never observe
/// the engine as busy while the driver is deciding to go idle.
#[derive(Debug)]
pub struct SendEngine {
    capacity: usize,
    state: Mutex<SendState>,
}

impl SendEngine {
    /// `capacity` is the size of the arena window frames are copied through.
    pub fn new(capacity: usize) -> Self {
        SendEngine {
            capacity,
            state: Mutex::new(SendState::default()),
        }
    }

    pub fn bind(&self, connection: SessionId) {
        let mut state = self.state.lock();
        state.clear();
        state.connection = Some(connection);
    }

    /// Detaches the engine from its connection and drops pending frames.
    /// Returns how many frames were dropped.
    pub fn unbind(&self) -> usize {
        let mut state = self.state.lock();
        state.connection = None;
        state.clear()
    }

    pub fn connection(&self) -> Option<SessionId> {
        self.state.lock().connection
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Submits a frame for `connection`.
    ///
    /// Fails with `SessionNotFound` when the engine is bound to another
    /// connection, or to none, so frames never leak onto a reused slot.
    pub fn enqueue(&self, connection: SessionId, frame: Bytes) -> AppResult<EnqueueOutcome> {
        let mut state = self.state.lock();
        if state.connection != Some(connection) {
            return Err(AppError::SessionNotFound(connection));
        }
        if state.writing {
            state.queue.push_back(frame);
            trace!("connection {} frame queued, {} waiting", connection, state.queue.len());
            return Ok(EnqueueOutcome::Queued);
        }
        state.writing = true;
        state.bytes_to_send = Some(frame);
        state.total_sent = 0;
        Ok(EnqueueOutcome::Started)
    }

    /// Copies the next chunk of the in-flight frame into `window` and returns
    /// its length. Returns 0 when nothing is in flight.
    pub fn fill_window(&self, window: &mut [u8]) -> usize {
        let state = self.state.lock();
        let Some(frame) = state.bytes_to_send.as_ref() else {
            return 0;
        };
        let remaining = &frame[state.total_sent..];
        let next = remaining.len().min(self.capacity).min(window.len());
        window[..next].copy_from_slice(&remaining[..next]);
        next
    }

    pub fn complete_write(&self, transferred: usize) -> SendProgress {
        let mut state = self.state.lock();
        let frame_len = match state.bytes_to_send.as_ref() {
            Some(frame) => frame.len(),
            None => return SendProgress::Idle,
        };
        state.total_sent += transferred;
        if state.total_sent < frame_len {
            return SendProgress::Continue;
        }
        match state.queue.pop_front() {
            Some(next) => {
                state.bytes_to_send = Some(next);
                state.total_sent = 0;
                SendProgress::NextFrame
            }
            None => {
                state.writing = false;
                state.bytes_to_send = None;
                state.total_sent = 0;
                SendProgress::Idle
            }
        }
    }
}
