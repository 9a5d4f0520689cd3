mod network;
mod service;
mod utils;

pub use network::{
    ArenaWindow, BufferArena, CloseReason, EnqueueOutcome, FrameHeader, HeaderLayout, JsonCodec,
    MessageCodec, RawCodec, ReceiveEngine, ReceiveEvent, ReceivePhase, ReceivedMessage, SendEngine,
    SendProgress, Session, SessionId, SessionWriter, MAX_FRAME_LENGTH, MIN_FRAME_LENGTH,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, ClientConfig, ClientHandler,
    FramewireConfig, Server, ServerConfig, ServerHandler, ServerWriter,
};
pub use utils::{AddressablePool, ObjectPool, PoolError};
