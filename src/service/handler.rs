use std::io;

use tracing::{debug, error, warn};

use crate::network::{Session, SessionId};
use crate::AppError;

/// Application callbacks for a [`Server`](super::Server).
///
/// Every callback runs on the task that owns the connection's receive cycle,
/// so a slow `on_read` delays further reads on that connection only.
pub trait ServerHandler<M>: Send + Sync + 'static {
    fn on_accepted(&self, session: &Session<M>) {
        debug!("connection {} accepted from {}", session.id(), session.peer_addr());
    }

    fn on_read(&self, session: &Session<M>, handler_id: u32, message: M);

    fn on_closed(&self, session: &Session<M>) {
        debug!("connection {} closed", session.id());
    }

    /// Socket errors outside the reset/aborted/refused set, accept failures
    /// included.
    ///
    /// A failed read or write is fatal to its connection: by the time this
    /// runs the connection is being torn down and `on_closed` follows.
    fn on_socket_error(&self, err: &io::Error) {
        error!("socket error: {}", err);
    }
}

/// Application callbacks for a [`Client`](super::Client).
pub trait ClientHandler<M>: Send + Sync + 'static {
    fn on_connected(&self, connection: SessionId) {
        debug!("connection {} established", connection);
    }

    fn on_read(&self, handler_id: u32, message: M);

    fn on_disconnected(&self, connection: SessionId) {
        debug!("connection {} disconnected", connection);
    }

    fn on_connect_failed(&self, err: &AppError) {
        warn!("connect failed: {}", err);
    }

    fn on_socket_error(&self, err: &io::Error) {
        error!("socket error: {}", err);
    }
}
