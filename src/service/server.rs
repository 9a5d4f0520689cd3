use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::ServerConfig;
use super::handler::ServerHandler;
use crate::network::{
    BufferArena, CloseReason, EnqueueOutcome, ErrorSink, MessageCodec, ReceiveSlot,
    ReceivedMessage, SendSlot, Session, SessionId, SessionWriter,
};
use crate::utils::{AddressablePool, ObjectPool};
use crate::{AppError, AppResult};

const MAX_ACCEPT_BACKOFF_SECS: u64 = 64;

/// One outstanding accept on the listener. Carries the admission permit from
/// the moment it is acquired until the accepted connection takes it over.
#[derive(Debug)]
struct AcceptRequest {
    id: usize,
    permit: Option<OwnedSemaphorePermit>,
    armed_at: Option<Instant>,
}

impl AcceptRequest {
    fn new(id: usize) -> Self {
        AcceptRequest {
            id,
            permit: None,
            armed_at: None,
        }
    }

    fn arm(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
        self.armed_at = Some(Instant::now());
    }

    fn disarm(&mut self) -> Option<OwnedSemaphorePermit> {
        if let Some(armed_at) = self.armed_at.take() {
            trace!("accept request {} waited {:?}", self.id, armed_at.elapsed());
        }
        self.permit.take()
    }
}

struct ServerCore<C, H> {
    config: ServerConfig,
    codec: C,
    handler: H,
    limit_connections: Arc<Semaphore>,
    accept_pool: ObjectPool<AcceptRequest>,
    receive_slots: AddressablePool<SessionId, Arc<ReceiveSlot>>,
    send_slots: AddressablePool<SessionId, Arc<SendSlot>>,
    next_connection_id: AtomicU64,
    next_accept_id: AtomicUsize,
    connection_count: AtomicUsize,
    shutdown: CancellationToken,
}

/// Server side orchestrator.
///
/// Owns the listening socket, the admission limit and the pre-allocated
/// receive and send slots, and routes every completed message to the
/// [`ServerHandler`]. Cloning gives another handle on the same server.
pub struct Server<C, H>
where
    C: MessageCodec,
    H: ServerHandler<C::Message>,
{
    core: Arc<ServerCore<C, H>>,
}

impl<C, H> Clone for Server<C, H>
where
    C: MessageCodec,
    H: ServerHandler<C::Message>,
{
    fn clone(&self) -> Self {
        Server {
            core: self.core.clone(),
        }
    }
}

impl<C, H> fmt::Debug for Server<C, H>
where
    C: MessageCodec,
    H: ServerHandler<C::Message>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.core.config)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl<C, H> Server<C, H>
where
    C: MessageCodec,
    H: ServerHandler<C::Message>,
{
    /// Validates `config` and pre-allocates every buffer and pooled slot.
    pub fn new(config: ServerConfig, codec: C, handler: H) -> AppResult<Self> {
        config.validate()?;
        let layout = config.header_layout;
        let max_connections = config.max_connections;

        let receive_arena =
            BufferArena::allocate(config.receive_buffer_size, max_connections, layout.header_size());
        let send_arena = BufferArena::allocate(config.send_buffer_size, max_connections, 0);
        let receive_slots = AddressablePool::prewarm(max_connections, |index| {
            Ok(Arc::new(ReceiveSlot::new(index, receive_arena.assign()?, layout)))
        })?;
        let send_slots = AddressablePool::prewarm(max_connections, |index| {
            Ok(Arc::new(SendSlot::new(index, send_arena.assign()?)))
        })?;
        let accept_pool =
            ObjectPool::prewarm(config.max_simultaneous_accepts, |index| Ok(AcceptRequest::new(index)))?;
        info!(
            "server initialized: {} connections, {} bytes receive arena, {} bytes send arena, {} accept lanes",
            max_connections,
            receive_arena.total_size(),
            send_arena.total_size(),
            config.max_simultaneous_accepts
        );

        Ok(Server {
            core: Arc::new(ServerCore {
                limit_connections: Arc::new(Semaphore::new(max_connections)),
                next_accept_id: AtomicUsize::new(config.max_simultaneous_accepts),
                config,
                codec,
                handler,
                accept_pool,
                receive_slots,
                send_slots,
                next_connection_id: AtomicU64::new(1),
                connection_count: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Binds the configured address with the configured backlog.
    pub async fn listen(&self) -> AppResult<TcpListener> {
        let config = &self.core.config;
        let address: SocketAddr = config.listen_address().parse().map_err(|err| {
            AppError::InvalidValue(format!("listen address {}: {}", config.listen_address(), err))
        })?;
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        if let Err(err) = socket.bind(address) {
            let error_msg = format!("Failed to bind server to address: {} - Error: {}", address, err);
            error!("{}", error_msg);
            return Err(AppError::IllegalStateError(error_msg));
        }
        let listener = socket.listen(config.backlog)?;
        info!("tcp server binding to {} for listening", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts on `listener` until [`shutdown`](Self::shutdown) is called,
    /// then waits for every open connection to finish its close cycle.
    pub async fn serve(&self, listener: TcpListener) -> AppResult<()> {
        let listener = Arc::new(listener);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let mut lanes = JoinSet::new();
        for lane in 0..self.core.config.max_simultaneous_accepts {
            lanes.spawn(self.core.clone().accept_loop(
                listener.clone(),
                lane,
                shutdown_complete_tx.clone(),
            ));
        }

        self.core.shutdown.cancelled().await;
        info!("server shutting down, {} connections open", self.connection_count());
        while lanes.join_next().await.is_some() {}

        // each connection task holds a sender, recv returns None once all are gone
        drop(shutdown_complete_tx);
        let _ = shutdown_complete_rx.recv().await;
        info!("server stopped");
        Ok(())
    }

    pub async fn run(&self) -> AppResult<()> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        self.core.shutdown.cancel();
    }

    /// A handle for writing to connections from outside any callback.
    pub fn writer(&self) -> ServerWriter<C::Message> {
        ServerWriter {
            inner: self.core.clone(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.core.connection_count.load(Ordering::Acquire)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.core
            .send_slots
            .enumerate_active()
            .map(|(id, _)| id)
            .collect()
    }
}

impl<C, H> ServerCore<C, H>
where
    C: MessageCodec,
    H: ServerHandler<C::Message>,
{
    async fn accept_loop(
        self: Arc<Self>,
        listener: Arc<TcpListener>,
        lane: usize,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        debug!("accept lane {} started", lane);
        let mut backoff = 1;
        loop {
            let mut request = self.borrow_accept_request();
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.limit_connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            request.arm(permit);

            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let permit = request.disarm();
            self.return_accept_request(request);

            match (accepted, permit) {
                (Ok((socket, peer)), Some(permit)) => {
                    backoff = 1;
                    tokio::spawn(self.clone().handle_connection(
                        socket,
                        peer,
                        permit,
                        shutdown_complete_tx.clone(),
                    ));
                }
                (Ok((_, peer)), None) => {
                    error!("accept lane {} accepted {} without a permit", lane, peer);
                }
                (Err(err), permit) => {
                    drop(permit);
                    warn!("accept lane {} failed: {}, retrying in {}s", lane, err, backoff);
                    self.handler.on_socket_error(&err);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = time::sleep(Duration::from_secs(backoff)) => {}
                    }
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF_SECS);
                }
            }
        }
        debug!("accept lane {} exited", lane);
    }

    fn borrow_accept_request(&self) -> AcceptRequest {
        self.accept_pool.borrow().unwrap_or_else(|| {
            let id = self.next_accept_id.fetch_add(1, Ordering::Relaxed);
            debug!("accept pool empty, creating accept request {}", id);
            AcceptRequest::new(id)
        })
    }

    fn return_accept_request(&self, request: AcceptRequest) {
        if self.accept_pool.len() < self.config.max_simultaneous_accepts {
            self.accept_pool.give_back(request);
        }
    }

    fn borrow_slots(&self, connection: SessionId) -> AppResult<(Arc<ReceiveSlot>, Arc<SendSlot>)> {
        let receive_slot = self.receive_slots.borrow(connection)?;
        match self.send_slots.borrow(connection) {
            Ok(send_slot) => Ok((receive_slot, send_slot)),
            Err(err) => {
                self.receive_slots.give_back(connection);
                Err(err.into())
            }
        }
    }

    fn error_sink(self: &Arc<Self>) -> ErrorSink {
        let core: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |err: &io::Error| {
            if let Some(core) = core.upgrade() {
                core.handler.on_socket_error(err);
            }
        })
    }

    fn session(self: &Arc<Self>, connection: SessionId, peer: SocketAddr) -> Session<C::Message> {
        let writer: Arc<dyn SessionWriter<C::Message>> = self.clone();
        Session::new(connection, peer, writer)
    }

    async fn handle_connection(
        self: Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        permit: OwnedSemaphorePermit,
        _shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let connection = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = socket.set_nodelay(self.config.no_delay) {
            debug!("connection {} set_nodelay failed: {}", connection, err);
        }
        let (receive_slot, send_slot) = match self.borrow_slots(connection) {
            Ok(slots) => slots,
            Err(err) => {
                warn!("rejecting connection from {}: {}", peer, err);
                return;
            }
        };

        let cancel = self.shutdown.child_token();
        let on_error = self.error_sink();
        let (reader, writer) = socket.into_split();
        receive_slot.bind(reader).await;
        send_slot
            .bind(connection, writer, cancel.clone(), on_error.clone())
            .await;
        let count = self.connection_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "connection {} from {} registered, {} open",
            connection, peer, count
        );

        let session = self.session(connection, peer);
        self.handler.on_accepted(&session);
        let reason = receive_slot
            .run_cycle(
                connection,
                &cancel,
                self.config.close_on_malformed_header,
                &on_error,
                |message| self.dispatch(&session, message),
            )
            .await;

        self.close_connection(&session, &receive_slot, &send_slot, &cancel, reason)
            .await;
        drop(permit);
    }

    fn dispatch(&self, session: &Session<C::Message>, message: ReceivedMessage) {
        let ReceivedMessage {
            handler_id,
            payload,
        } = message;
        match self.codec.decode(handler_id, payload) {
            Ok(message) => self.handler.on_read(session, handler_id, message),
            Err(err) => warn!(
                "connection {} handler {} payload dropped: {}",
                session.id(),
                handler_id,
                err
            ),
        }
    }

    async fn close_connection(
        &self,
        session: &Session<C::Message>,
        receive_slot: &ReceiveSlot,
        send_slot: &SendSlot,
        cancel: &CancellationToken,
        reason: CloseReason,
    ) {
        let connection = session.id();
        debug!("connection {} {}", connection, reason);
        self.handler.on_closed(session);

        cancel.cancel();
        if let Some(mut writer) = send_slot.unbind().await {
            if let Err(err) = writer.shutdown().await {
                trace!("connection {} shutdown: {}", connection, err);
            }
        }
        drop(receive_slot.unbind().await);
        self.send_slots.give_back(connection);
        self.receive_slots.give_back(connection);

        let count = self.connection_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!("connection {} released, {} open", connection, count);
    }

    fn encode(&self, handler_id: u32, message: &C::Message) -> AppResult<Bytes> {
        let payload = self.codec.encode(handler_id, message)?;
        self.config.header_layout.encode_frame(handler_id, &payload)
    }

    fn submit(&self, target: SessionId, frame: Bytes) -> AppResult<EnqueueOutcome> {
        let slot = self
            .send_slots
            .lookup(target)
            .ok_or(AppError::SessionNotFound(target))?;
        slot.submit(target, frame)
    }
}

impl<C, H> SessionWriter<C::Message> for ServerCore<C, H>
where
    C: MessageCodec,
    H: ServerHandler<C::Message>,
{
    fn write_to(&self, target: SessionId, handler_id: u32, message: &C::Message) -> AppResult<EnqueueOutcome> {
        let frame = self.encode(handler_id, message)?;
        self.submit(target, frame)
    }

    fn write_to_all_except(
        &self,
        excluded: Option<SessionId>,
        handler_id: u32,
        message: &C::Message,
    ) -> AppResult<usize> {
        let frame = self.encode(handler_id, message)?;
        let mut delivered = 0;
        for (connection, slot) in self.send_slots.enumerate_active() {
            if Some(connection) == excluded {
                continue;
            }
            match slot.submit(connection, frame.clone()) {
                Ok(_) => delivered += 1,
                Err(err) => debug!("broadcast skipped connection {}: {}", connection, err),
            }
        }
        Ok(delivered)
    }
}

impl<C, H> Drop for ServerCore<C, H> {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

/// Writes to server connections from outside the handler callbacks.
pub struct ServerWriter<M> {
    inner: Arc<dyn SessionWriter<M>>,
}

impl<M> Clone for ServerWriter<M> {
    fn clone(&self) -> Self {
        ServerWriter {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for ServerWriter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerWriter")
    }
}

impl<M> ServerWriter<M> {
    pub fn write_to(&self, target: SessionId, handler_id: u32, message: &M) -> AppResult<EnqueueOutcome> {
        self.inner.write_to(target, handler_id, message)
    }

    pub fn write_to_all(&self, handler_id: u32, message: &M) -> AppResult<usize> {
        self.inner.write_to_all_except(None, handler_id, message)
    }

    pub fn write_to_all_except(&self, excluded: SessionId, handler_id: u32, message: &M) -> AppResult<usize> {
        self.inner.write_to_all_except(Some(excluded), handler_id, message)
    }
}
