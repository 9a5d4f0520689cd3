use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::config::ClientConfig;
use super::handler::ClientHandler;
use crate::network::{
    BufferArena, EnqueueOutcome, ErrorSink, MessageCodec, ReceiveSlot, ReceivedMessage, SendSlot,
    SessionId,
};
use crate::utils::AddressablePool;
use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
struct ActiveConnection {
    id: SessionId,
    cancel: CancellationToken,
}

struct ClientCore<C, H> {
    config: ClientConfig,
    codec: C,
    handler: H,
    receive_slots: AddressablePool<SessionId, Arc<ReceiveSlot>>,
    send_slots: AddressablePool<SessionId, Arc<SendSlot>>,
    current: Mutex<Option<ActiveConnection>>,
    next_connection_id: AtomicU64,
}

/// Client side orchestrator: one outbound connection at a time.
///
/// Uses the same receive and send machinery as the server with pools of a
/// single slot each. After a disconnect the client may connect again.
pub struct Client<C, H>
where
    C: MessageCodec,
    H: ClientHandler<C::Message>,
{
    core: Arc<ClientCore<C, H>>,
}

impl<C, H> Clone for Client<C, H>
where
    C: MessageCodec,
    H: ClientHandler<C::Message>,
{
    fn clone(&self) -> Self {
        Client {
            core: self.core.clone(),
        }
    }
}

impl<C, H> fmt::Debug for Client<C, H>
where
    C: MessageCodec,
    H: ClientHandler<C::Message>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.core.config)
            .field("connection", &self.connection())
            .finish()
    }
}

impl<C, H> Client<C, H>
where
    C: MessageCodec,
    H: ClientHandler<C::Message>,
{
    pub fn new(config: ClientConfig, codec: C, handler: H) -> AppResult<Self> {
        config.validate()?;
        let layout = config.header_layout;
        let receive_arena = BufferArena::allocate(config.receive_buffer_size, 1, layout.header_size());
        let send_arena = BufferArena::allocate(config.send_buffer_size, 1, 0);
        let receive_slots = AddressablePool::prewarm(1, |index| {
            Ok(Arc::new(ReceiveSlot::new(index, receive_arena.assign()?, layout)))
        })?;
        let send_slots = AddressablePool::prewarm(1, |index| {
            Ok(Arc::new(SendSlot::new(index, send_arena.assign()?)))
        })?;

        Ok(Client {
            core: Arc::new(ClientCore {
                config,
                codec,
                handler,
                receive_slots,
                send_slots,
                current: Mutex::new(None),
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }

    /// Connects to `address`, honouring the configured connect timeout.
    ///
    /// Failures are reported to [`ClientHandler::on_connect_failed`] and
    /// returned. Fails with `IllegalStateError` while a connection is open.
    pub async fn connect<A: ToSocketAddrs>(&self, address: A) -> AppResult<SessionId> {
        if let Some(open) = self.connection() {
            return Err(AppError::IllegalStateError(format!(
                "connection {} is still open",
                open
            )));
        }
        let stream = match self.core.open_stream(address).await {
            Ok(stream) => stream,
            Err(err) => {
                self.core.handler.on_connect_failed(&err);
                return Err(err);
            }
        };
        self.core.clone().register(stream).await
    }

    /// Encodes `message` and queues it on the open connection.
    pub fn send(&self, handler_id: u32, message: &C::Message) -> AppResult<EnqueueOutcome> {
        let connection = self.connection().ok_or(AppError::NotConnected)?;
        let payload = self.core.codec.encode(handler_id, message)?;
        let frame = self.core.config.header_layout.encode_frame(handler_id, &payload)?;
        self.core.submit(connection, frame)
    }

    /// Closes the open connection, if any. The close cycle runs on the
    /// receive task and ends with [`ClientHandler::on_disconnected`].
    pub fn disconnect(&self) {
        if let Some(active) = self.core.current.lock().as_ref() {
            debug!("disconnecting connection {}", active.id);
            active.cancel.cancel();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.current.lock().is_some()
    }

    pub fn connection(&self) -> Option<SessionId> {
        self.core.current.lock().as_ref().map(|active| active.id)
    }
}

impl<C, H> ClientCore<C, H>
where
    C: MessageCodec,
    H: ClientHandler<C::Message>,
{
    async fn open_stream<A: ToSocketAddrs>(&self, address: A) -> AppResult<TcpStream> {
        let connect = TcpStream::connect(address);
        let stream = match self.config.connect_timeout() {
            Some(timeout) => time::timeout(timeout, connect)
                .await
                .map_err(|_| AppError::ConnectTimeout(format!("{:?}", timeout)))??,
            None => connect.await?,
        };
        if let Err(err) = stream.set_nodelay(self.config.no_delay) {
            debug!("set_nodelay failed: {}", err);
        }
        Ok(stream)
    }

    async fn register(self: Arc<Self>, stream: TcpStream) -> AppResult<SessionId> {
        let connection = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_addr()?;
        let receive_slot = self.receive_slots.borrow(connection)?;
        let send_slot = match self.send_slots.borrow(connection) {
            Ok(slot) => slot,
            Err(err) => {
                self.receive_slots.give_back(connection);
                return Err(err.into());
            }
        };

        let cancel = CancellationToken::new();
        let on_error = self.error_sink();
        let (reader, writer) = stream.into_split();
        receive_slot.bind(reader).await;
        send_slot
            .bind(connection, writer, cancel.clone(), on_error.clone())
            .await;
        *self.current.lock() = Some(ActiveConnection {
            id: connection,
            cancel: cancel.clone(),
        });
        info!("connection {} established to {}", connection, peer);
        self.handler.on_connected(connection);

        tokio::spawn(async move {
            let reason = receive_slot
                .run_cycle(
                    connection,
                    &cancel,
                    self.config.close_on_malformed_header,
                    &on_error,
                    |message| self.dispatch(message),
                )
                .await;
            debug!("connection {} {}", connection, reason);

            cancel.cancel();
            if let Some(mut writer) = send_slot.unbind().await {
                if let Err(err) = writer.shutdown().await {
                    trace!("connection {} shutdown: {}", connection, err);
                }
            }
            drop(receive_slot.unbind().await);
            self.send_slots.give_back(connection);
            self.receive_slots.give_back(connection);
            {
                let mut current = self.current.lock();
                if current.as_ref().map(|active| active.id) == Some(connection) {
                    current.take();
                }
            }
            self.handler.on_disconnected(connection);
        });
        Ok(connection)
    }

    fn dispatch(&self, message: ReceivedMessage) {
        let ReceivedMessage {
            handler_id,
            payload,
        } = message;
        match self.codec.decode(handler_id, payload) {
            Ok(message) => self.handler.on_read(handler_id, message),
            Err(err) => warn!("handler {} payload dropped: {}", handler_id, err),
        }
    }

    fn submit(&self, connection: SessionId, frame: Bytes) -> AppResult<EnqueueOutcome> {
        let slot = self
            .send_slots
            .lookup(connection)
            .ok_or(AppError::NotConnected)?;
        slot.submit(connection, frame)
    }

    fn error_sink(self: &Arc<Self>) -> ErrorSink {
        let core: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |err: &io::Error| {
            if let Some(core) = core.upgrade() {
                core.handler.on_socket_error(err);
            }
        })
    }
}

impl<C, H> Drop for ClientCore<C, H> {
    fn drop(&mut self) {
        debug!("tcp client dropped");
    }
}
