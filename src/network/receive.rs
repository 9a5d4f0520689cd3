use std::ops::Range;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::arena::ArenaWindow;
use super::frame::HeaderLayout;
use crate::AppError;

/// One complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub handler_id: u32,
    pub payload: Bytes,
}

/// Outcome of feeding one read completion into a [`ReceiveEngine`].
#[derive(Debug)]
pub enum ReceiveEvent {
    /// More bytes are needed, issue the next read.
    Pending,
    /// The header failed validation. The engine is back at the start of a
    /// header read.
    Rejected(AppError),
    /// A message is complete. The engine is back at the start of a header read.
    Message(ReceivedMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePhase {
    AwaitingHeader,
    AwaitingPayload,
}

/// Per-connection reassembly of `header + payload` across partial reads.
///
/// The engine never touches a socket. The driver asks for
/// [`next_read_range`](Self::next_read_range), lands that many bytes (or fewer)
/// in the arena window, then reports them with
/// [`complete_read`](Self::complete_read). Reads that finish immediately and
/// reads that finish after suspending go through the same call.
#[derive(Debug)]
pub struct ReceiveEngine {
    layout: HeaderLayout,
    phase: ReceivePhase,
    header_seen: usize,
    total_data_length: usize,
    handler_id: u32,
    total_data: Option<BytesMut>,
    processed: usize,
}

impl ReceiveEngine {
    pub fn new(layout: HeaderLayout) -> Self {
        ReceiveEngine {
            layout,
            phase: ReceivePhase::AwaitingHeader,
            header_seen: 0,
            total_data_length: 0,
            handler_id: 0,
            total_data: None,
            processed: 0,
        }
    }

    pub fn phase(&self) -> ReceivePhase {
        self.phase
    }

    pub fn reset(&mut self) {
        self.phase = ReceivePhase::AwaitingHeader;
        self.header_seen = 0;
        self.total_data_length = 0;
        self.handler_id = 0;
        self.total_data = None;
        self.processed = 0;
    }

    pub fn remaining(&self) -> usize {
        self.total_data_length - self.processed
    }

    /// The part of `window` the next read must fill.
    pub fn next_read_range(&self, window: &ArenaWindow) -> Range<usize> {
        let header_size = self.layout.header_size();
        match self.phase {
            ReceivePhase::AwaitingHeader => self.header_seen..header_size,
            ReceivePhase::AwaitingPayload => {
                let next = self.remaining().min(window.payload_capacity());
                header_size..header_size + next
            }
        }
    }

    /// Accounts for `transferred` bytes that just landed in the range returned
    /// by the preceding [`next_read_range`](Self::next_read_range) call.
    pub fn complete_read(&mut self, window: &ArenaWindow, transferred: usize) -> ReceiveEvent {
        debug_assert!(transferred <= self.next_read_range(window).len());
        match self.phase {
            ReceivePhase::AwaitingHeader => {
                self.header_seen += transferred;
                if self.header_seen < self.layout.header_size() {
                    trace!(
                        "header incomplete: {}/{} bytes",
                        self.header_seen,
                        self.layout.header_size()
                    );
                    return ReceiveEvent::Pending;
                }
                match self.layout.decode_header(window.header()) {
                    Ok(header) => {
                        self.total_data_length = header.length;
                        self.handler_id = header.handler_id;
                        self.total_data = Some(BytesMut::with_capacity(header.length));
                        self.phase = ReceivePhase::AwaitingPayload;
                        ReceiveEvent::Pending
                    }
                    Err(err) => {
                        self.reset();
                        ReceiveEvent::Rejected(err)
                    }
                }
            }
            ReceivePhase::AwaitingPayload => {
                if let Some(total_data) = self.total_data.as_mut() {
                    total_data.extend_from_slice(&window.payload()[..transferred]);
                }
                self.processed += transferred;
                if self.remaining() > 0 {
                    return ReceiveEvent::Pending;
                }
                let message = ReceivedMessage {
                    handler_id: self.handler_id,
                    payload: self.total_data.take().unwrap_or_default().freeze(),
                };
                debug!(
                    "message complete: handler {} with {} bytes",
                    message.handler_id,
                    message.payload.len()
                );
                self.reset();
                ReceiveEvent::Message(message)
            }
        }
    }
}
