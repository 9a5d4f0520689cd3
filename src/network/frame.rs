use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Smallest payload a frame may carry.
pub const MIN_FRAME_LENGTH: usize = 1;
/// Largest payload a frame may carry.
pub const MAX_FRAME_LENGTH: usize = u16::MAX as usize;

/// Width of the handler id field that follows the 4 byte length.
///
/// ```text
/// Compact: [ length u32 LE ][ handler u16 LE ][ payload ]   6 byte header
/// Wide:    [ length u32 LE ][ handler u32 LE ][ payload ]   8 byte header
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderLayout {
    #[default]
    Compact,
    Wide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub handler_id: u32,
}

impl HeaderLayout {
    pub const fn header_size(self) -> usize {
        match self {
            HeaderLayout::Compact => 6,
            HeaderLayout::Wide => 8,
        }
    }

    /// Decodes and validates a header. `src` must hold at least
    /// [`header_size`](Self::header_size) bytes.
    pub fn decode_header(self, mut src: &[u8]) -> AppResult<FrameHeader> {
        if src.len() < self.header_size() {
            return Err(AppError::IllegalStateError(format!(
                "header needs {} bytes, got {}",
                self.header_size(),
                src.len()
            )));
        }
        let length = src.get_u32_le() as usize;
        let handler_id = match self {
            HeaderLayout::Compact => src.get_u16_le() as u32,
            HeaderLayout::Wide => src.get_u32_le(),
        };
        check_length(length)?;
        Ok(FrameHeader { length, handler_id })
    }

    pub fn encode_header(self, handler_id: u32, length: usize, dst: &mut BytesMut) -> AppResult<()> {
        check_length(length)?;
        dst.put_u32_le(length as u32);
        match self {
            HeaderLayout::Compact => {
                let handler_id = u16::try_from(handler_id)
                    .map_err(|_| AppError::HandlerIdOutOfRange(handler_id))?;
                dst.put_u16_le(handler_id);
            }
            HeaderLayout::Wide => dst.put_u32_le(handler_id),
        }
        Ok(())
    }

    /// Builds one complete outbound frame: header followed by payload.
    pub fn encode_frame(self, handler_id: u32, payload: &[u8]) -> AppResult<Bytes> {
        let mut frame = BytesMut::with_capacity(self.header_size() + payload.len());
        self.encode_header(handler_id, payload.len(), &mut frame)?;
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    /// Splits one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` while `src` is still short of a whole frame.
    pub fn decode_frame(self, src: &mut BytesMut) -> AppResult<Option<(u32, Bytes)>> {
        if src.len() < self.header_size() {
            return Ok(None);
        }
        let header = self.decode_header(&src[..self.header_size()])?;
        if src.len() < self.header_size() + header.length {
            src.reserve(self.header_size() + header.length - src.len());
            return Ok(None);
        }
        src.advance(self.header_size());
        Ok(Some((header.handler_id, src.split_to(header.length).freeze())))
    }
}

pub fn check_length(length: usize) -> AppResult<()> {
    if !(MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&length) {
        return Err(AppError::InvalidFrameLength(length));
    }
    Ok(())
}
