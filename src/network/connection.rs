use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::arena::ArenaWindow;
use super::frame::HeaderLayout;
use super::receive::{ReceiveEngine, ReceiveEvent, ReceivedMessage};
use super::send::{EnqueueOutcome, SendEngine, SendProgress};
use super::session::SessionId;
use crate::AppResult;

/// Callback for socket errors this layer does not classify.
pub type ErrorSink = Arc<dyn Fn(&io::Error) + Send + Sync>;

/// Why a connection's receive cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer shut down its side (zero-byte read).
    PeerClosed,
    /// Connection reset, aborted or refused.
    Reset(ErrorKind),
    /// An error outside the transient set, already reported to the handler.
    SocketError(ErrorKind),
    /// A header failed validation and the connection was configured to close.
    MalformedHeader,
    /// Closed locally: shutdown, explicit disconnect or a failed send.
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Reset(kind) => write!(f, "reset ({kind:?})"),
            CloseReason::SocketError(kind) => write!(f, "socket error ({kind:?})"),
            CloseReason::MalformedHeader => write!(f, "malformed header"),
            CloseReason::Cancelled => write!(f, "closed locally"),
        }
    }
}

/// Errors that tear the connection down without bothering the application.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
    )
}

// Both helpers try the operation right away and only suspend on readiness
// when the socket would block, so immediate and deferred completions come
// back through the same return path.
async fn read_some(reader: &OwnedReadHalf, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => reader.readable().await?,
            Err(err) => return Err(err),
        }
    }
}

async fn write_some(writer: &OwnedWriteHalf, buf: &[u8]) -> io::Result<usize> {
    loop {
        match writer.try_write(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => writer.writable().await?,
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug)]
struct ReceiveIo {
    reader: Option<OwnedReadHalf>,
    window: ArenaWindow,
    engine: ReceiveEngine,
}

/// Pooled receive request: an arena window plus the reassembly engine,
/// bound to one connection's read half at a time.
#[derive(Debug)]
pub struct ReceiveSlot {
    index: usize,
    io: AsyncMutex<ReceiveIo>,
}

impl ReceiveSlot {
    pub fn new(index: usize, window: ArenaWindow, layout: HeaderLayout) -> Self {
        ReceiveSlot {
            index,
            io: AsyncMutex::new(ReceiveIo {
                reader: None,
                window,
                engine: ReceiveEngine::new(layout),
            }),
        }
    }

    pub async fn bind(&self, reader: OwnedReadHalf) {
        let mut io = self.io.lock().await;
        io.engine.reset();
        io.reader = Some(reader);
    }

    pub async fn unbind(&self) -> Option<OwnedReadHalf> {
        let mut io = self.io.lock().await;
        io.engine.reset();
        io.reader.take()
    }

    /// Runs the receive cycle until the connection ends, handing every
    /// complete message to `on_message` on the reading task.
    pub async fn run_cycle<F>(
        &self,
        connection: SessionId,
        cancel: &CancellationToken,
        close_on_malformed_header: bool,
        on_error: &ErrorSink,
        mut on_message: F,
    ) -> CloseReason
    where
        F: FnMut(ReceivedMessage),
    {
        let mut io = self.io.lock().await;
        let ReceiveIo {
            reader,
            window,
            engine,
        } = &mut *io;
        let Some(reader) = reader.as_ref() else {
            warn!("receive slot {} started without a socket", self.index);
            return CloseReason::Cancelled;
        };
        engine.reset();

        loop {
            let range = engine.next_read_range(window);
            let result = tokio::select! {
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                result = read_some(reader, &mut window[range]) => result,
            };
            match result {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => match engine.complete_read(window, n) {
                    ReceiveEvent::Pending => {}
                    ReceiveEvent::Rejected(err) => {
                        warn!("connection {} sent an invalid header: {}", connection, err);
                        if close_on_malformed_header {
                            return CloseReason::MalformedHeader;
                        }
                    }
                    ReceiveEvent::Message(message) => on_message(message),
                },
                Err(err) if is_transient(&err) => return CloseReason::Reset(err.kind()),
                Err(err) => {
                    on_error(&err);
                    return CloseReason::SocketError(err.kind());
                }
            }
        }
    }
}

#[derive(Debug)]
struct SendIo {
    writer: Option<OwnedWriteHalf>,
    window: ArenaWindow,
}

#[derive(Clone)]
struct SendBinding {
    runtime: Handle,
    cancel: CancellationToken,
    on_error: ErrorSink,
}

/// Pooled send request: the per-connection [`SendEngine`] plus the arena
/// window frames are copied through on their way to the socket.
pub struct SendSlot {
    index: usize,
    engine: SendEngine,
    io: AsyncMutex<SendIo>,
    binding: parking_lot::Mutex<Option<SendBinding>>,
}

impl fmt::Debug for SendSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendSlot")
            .field("index", &self.index)
            .field("engine", &self.engine)
            .finish()
    }
}

impl SendSlot {
    pub fn new(index: usize, window: ArenaWindow) -> Self {
        SendSlot {
            index,
            engine: SendEngine::new(window.len()),
            io: AsyncMutex::new(SendIo {
                writer: None,
                window,
            }),
            binding: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the slot to `connection`. A failed write cancels `cancel`, which
    /// ends the connection's receive cycle and with it the connection.
    ///
    /// Writer tasks are spawned on the runtime that called `bind`, so frames
    /// can be submitted from threads outside of it.
    pub async fn bind(
        &self,
        connection: SessionId,
        writer: OwnedWriteHalf,
        cancel: CancellationToken,
        on_error: ErrorSink,
    ) {
        self.io.lock().await.writer = Some(writer);
        *self.binding.lock() = Some(SendBinding {
            runtime: Handle::current(),
            cancel,
            on_error,
        });
        self.engine.bind(connection);
    }

    /// Drops pending frames, waits for an in-flight write to stop and hands
    /// the write half back.
    pub async fn unbind(&self) -> Option<OwnedWriteHalf> {
        let dropped = self.engine.unbind();
        if dropped > 0 {
            debug!("send slot {} dropped {} pending frames", self.index, dropped);
        }
        self.binding.lock().take();
        self.io.lock().await.writer.take()
    }

    /// Submits one encoded frame. Starts a writer task when the engine was
    /// idle, otherwise leaves the frame queued behind the current write.
    pub fn submit(self: &Arc<Self>, connection: SessionId, frame: Bytes) -> AppResult<EnqueueOutcome> {
        let outcome = self.engine.enqueue(connection, frame)?;
        if outcome == EnqueueOutcome::Started {
            let runtime = self.binding.lock().as_ref().map(|binding| binding.runtime.clone());
            match runtime {
                Some(runtime) => {
                    runtime.spawn(self.clone().drive());
                }
                // unbound between enqueue and here: the frame was already dropped
                None => debug!("send slot {} unbound before its writer started", self.index),
            }
        }
        Ok(outcome)
    }

    async fn drive(self: Arc<Self>) {
        let binding = self.binding.lock().clone();
        let Some(binding) = binding else {
            return;
        };
        let mut io = self.io.lock().await;
        let SendIo { writer, window } = &mut *io;
        let Some(writer) = writer.as_ref() else {
            return;
        };

        loop {
            let len = self.engine.fill_window(window);
            if len == 0 {
                break;
            }
            let result = tokio::select! {
                _ = binding.cancel.cancelled() => break,
                result = write_some(writer, &window[..len]) => result,
            };
            match result {
                Ok(0) => {
                    warn!("send slot {} wrote zero bytes, closing connection", self.index);
                    binding.cancel.cancel();
                    break;
                }
                Ok(n) => {
                    trace!("send slot {} wrote {} bytes", self.index, n);
                    if self.engine.complete_write(n) == SendProgress::Idle {
                        break;
                    }
                }
                Err(err) => {
                    if !is_transient(&err) {
                        (binding.on_error)(&err);
                    }
                    debug!("send slot {} write failed: {}", self.index, err);
                    binding.cancel.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::arena::BufferArena;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn silent_sink() -> ErrorSink {
        Arc::new(|_: &io::Error| {})
    }

    #[tokio::test]
    async fn test_receive_cycle_delivers_split_frame() {
        let (mut client, server) = socket_pair().await;
        let layout = HeaderLayout::Compact;
        let arena = BufferArena::allocate(64, 1, layout.header_size());
        let slot = ReceiveSlot::new(0, arena.assign().unwrap(), layout);
        let (reader, _writer) = server.into_split();
        slot.bind(reader).await;

        let frame = layout.encode_frame(7, b"hello").unwrap();
        tokio::spawn(async move {
            client.write_all(&frame[..8]).await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(&frame[8..]).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let cancel = CancellationToken::new();
        let mut messages = Vec::new();
        let reason = slot
            .run_cycle(1, &cancel, false, &silent_sink(), |message| messages.push(message))
            .await;
        assert_eq!(reason, CloseReason::PeerClosed);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].handler_id, 7);
        assert_eq!(&messages[0].payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_receive_cycle_stops_on_cancel() {
        let (_client, server) = socket_pair().await;
        let arena = BufferArena::allocate(16, 1, 6);
        let slot = ReceiveSlot::new(0, arena.assign().unwrap(), HeaderLayout::Compact);
        let (reader, _writer) = server.into_split();
        slot.bind(reader).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let reason = slot
            .run_cycle(1, &cancel, false, &silent_sink(), |_| {})
            .await;
        assert_eq!(reason, CloseReason::Cancelled);
        assert!(slot.unbind().await.is_some());
    }

    #[tokio::test]
    async fn test_send_slot_writes_queued_frames_in_order() {
        let (mut client, server) = socket_pair().await;
        let arena = BufferArena::allocate(4, 1, 0);
        let slot = Arc::new(SendSlot::new(0, arena.assign().unwrap()));
        let (_reader, writer) = server.into_split();
        slot.bind(5, writer, CancellationToken::new(), silent_sink()).await;

        let mut expected = Vec::new();
        for i in 0..20u8 {
            let frame = Bytes::from(vec![i; (i as usize % 7) + 1]);
            expected.extend_from_slice(&frame);
            slot.submit(5, frame).unwrap();
        }

        let mut received = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_unbound_send_slot_rejects_frames() {
        let arena = BufferArena::allocate(4, 1, 0);
        let slot = Arc::new(SendSlot::new(0, arena.assign().unwrap()));
        assert!(slot.submit(1, Bytes::from_static(b"x")).is_err());
        assert!(slot.unbind().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_slot_accepts_frames_from_plain_thread() {
        let (mut client, server) = socket_pair().await;
        let arena = BufferArena::allocate(8, 1, 0);
        let slot = Arc::new(SendSlot::new(0, arena.assign().unwrap()));
        let (_reader, writer) = server.into_split();
        slot.bind(3, writer, CancellationToken::new(), silent_sink()).await;

        let submitter = slot.clone();
        std::thread::spawn(move || submitter.submit(3, Bytes::from_static(b"outside")))
            .join()
            .unwrap()
            .unwrap();

        let mut received = [0u8; 7];
        timeout(Duration::from_secs(5), client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"outside");
    }
}
