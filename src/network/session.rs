use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use super::send::EnqueueOutcome;
use crate::AppResult;

/// Stable identity of a live connection.
pub type SessionId = u64;

/// The narrow write capability a [`Session`] routes through.
///
/// Implemented by the server orchestrator; application code only ever sees
/// it behind a session or a [`ServerWriter`](crate::ServerWriter).
pub trait SessionWriter<M>: Send + Sync {
    fn write_to(&self, target: SessionId, handler_id: u32, message: &M) -> AppResult<EnqueueOutcome>;

    /// Sends to every live connection except `excluded`. Returns how many
    /// connections accepted the frame.
    fn write_to_all_except(
        &self,
        excluded: Option<SessionId>,
        handler_id: u32,
        message: &M,
    ) -> AppResult<usize>;
}

/// Short-lived handle on one connection, handed to the application with every
/// inbound message and on close.
pub struct Session<M> {
    id: SessionId,
    peer: SocketAddr,
    writer: Arc<dyn SessionWriter<M>>,
}

impl<M> Session<M> {
    pub(crate) fn new(id: SessionId, peer: SocketAddr, writer: Arc<dyn SessionWriter<M>>) -> Self {
        Session { id, peer, writer }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Writes back to this connection.
    pub fn write(&self, handler_id: u32, message: &M) -> AppResult<EnqueueOutcome> {
        self.writer.write_to(self.id, handler_id, message)
    }

    pub fn write_to(&self, target: SessionId, handler_id: u32, message: &M) -> AppResult<EnqueueOutcome> {
        self.writer.write_to(target, handler_id, message)
    }

    pub fn write_to_all_except(&self, excluded: SessionId, handler_id: u32, message: &M) -> AppResult<usize> {
        self.writer.write_to_all_except(Some(excluded), handler_id, message)
    }

    pub fn write_to_all(&self, handler_id: u32, message: &M) -> AppResult<usize> {
        self.writer.write_to_all_except(None, handler_id, message)
    }
}

impl<M> fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}
