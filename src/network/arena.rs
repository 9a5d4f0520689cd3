//! Shared buffer arena for socket I/O.
//!
//! One contiguous region is allocated up front and carved into equally sized
//! windows, one per I/O request. Windows are disjoint `BytesMut` views of the
//! same allocation, so each request writes into its own slice without locking
//! and without a heap allocation per read or write.

use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::debug;

use crate::{AppError, AppResult};

/// A fixed-size window into a [`BufferArena`].
///
/// Receive windows start with `header_size` bytes reserved for the frame
/// header, the rest is payload space. Send windows have no header region.
#[derive(Debug)]
pub struct ArenaWindow {
    offset: usize,
    header_size: usize,
    buf: BytesMut,
}

impl ArenaWindow {
    /// Position of this window inside the arena's backing region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Bytes available after the header region.
    pub fn payload_capacity(&self) -> usize {
        self.buf.len() - self.header_size
    }

    pub fn header(&self) -> &[u8] {
        &self.buf[..self.header_size]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_size..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.header_size..]
    }
}

impl Deref for ArenaWindow {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for ArenaWindow {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[derive(Debug)]
struct ArenaState {
    unissued: BytesMut,
    next_offset: usize,
    free: Vec<ArenaWindow>,
}

#[derive(Debug)]
pub struct BufferArena {
    slot_size: usize,
    header_size: usize,
    slot_count: usize,
    total_size: usize,
    state: Mutex<ArenaState>,
}

impl BufferArena {
    /// Allocates `(header_size + buffer_size) * slot_count` bytes in one block.
    pub fn allocate(buffer_size: usize, slot_count: usize, header_size: usize) -> Self {
        let slot_size = header_size + buffer_size;
        let total_size = slot_size * slot_count;
        debug!(
            "allocating buffer arena: {} slots x {} bytes = {} bytes",
            slot_count, slot_size, total_size
        );
        BufferArena {
            slot_size,
            header_size,
            slot_count,
            total_size,
            state: Mutex::new(ArenaState {
                unissued: BytesMut::zeroed(total_size),
                next_offset: 0,
                free: Vec::with_capacity(slot_count),
            }),
        }
    }

    /// Hands out a window, reusing the most recently released one first.
    pub fn assign(&self) -> AppResult<ArenaWindow> {
        let mut state = self.state.lock();
        if let Some(window) = state.free.pop() {
            return Ok(window);
        }
        if state.unissued.len() < self.slot_size || self.slot_size == 0 {
            return Err(AppError::ArenaExhausted(self.slot_count));
        }
        let offset = state.next_offset;
        let buf = state.unissued.split_to(self.slot_size);
        state.next_offset += self.slot_size;
        Ok(ArenaWindow {
            offset,
            header_size: self.header_size,
            buf,
        })
    }

    /// Returns a window to the free list.
    pub fn release(&self, mut window: ArenaWindow) {
        window.fill(0);
        self.state.lock().free.push(window);
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn free_windows(&self) -> usize {
        self.state.lock().free.len()
    }
}
