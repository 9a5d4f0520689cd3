//! Network Module Implementation
//!
//! Length-prefixed message framing over TCP streams.
//!
//! # Architecture
//!
//! The framing logic is split from the socket I/O:
//! - `frame`: wire header layout, encode and validation
//! - `arena`: one pre-allocated region carved into per-request windows
//! - `receive` / `send`: per-connection state machines that never touch a socket
//! - `connection`: pooled receive and send slots that drive those engines
//!   against a tokio socket
//! - `session`: the handle the application writes through
//! - `codec`: message (de)serialization on top of the payload bytes
//!
//! # Wire format
//!
//! Every frame is `[length u32 LE][handler id][payload]`, where the handler id
//! is 2 or 4 bytes wide depending on [`HeaderLayout`]. The payload length must
//! lie in `1..=65535`.

pub use arena::{ArenaWindow, BufferArena};
pub use codec::{JsonCodec, MessageCodec, RawCodec};
pub use connection::{CloseReason, ErrorSink, ReceiveSlot, SendSlot};
pub use frame::{FrameHeader, HeaderLayout, MAX_FRAME_LENGTH, MIN_FRAME_LENGTH};
pub use receive::{ReceiveEngine, ReceiveEvent, ReceivePhase, ReceivedMessage};
pub use send::{EnqueueOutcome, SendEngine, SendProgress};
pub use session::{Session, SessionId, SessionWriter};

mod arena;
mod codec;
mod connection;
mod frame;
mod receive;
mod send;
mod session;
