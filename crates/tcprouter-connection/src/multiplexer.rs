//! Multiplexed control connection
//!
//! One [`MultiplexedConnection`] wraps the framed control socket between a
//! client and the router. A dedicated writer task owns the write half and
//! drains a single FIFO queue, so frames leave in exactly the order they were
//! queued. The receive loop owns the read half and dispatches each frame to the
//! per-stream queue it belongs to.
//!
//! Per-stream queues are bounded. When the consumer of one stream stops
//! reading, the receive loop waits on that stream and every other stream on
//! the same connection waits with it (head-of-line blocking). Streams never
//! fail because an unrelated stream is slow; they are only delayed.

use crate::handshake::{FrameReader, FrameWriter};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tcprouter_proto::{
    CodecError, ControlCodec, ControlMessage, Frame, FrameType, StreamId, CONTROL_STREAM_ID,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

/// Largest payload carried by a single data frame
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Unexpected control message: {0}")]
    UnexpectedControl(&'static str),

    #[error("Peer opened stream {0} on a router-side connection")]
    UnexpectedOpen(StreamId),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    #[error("No available stream IDs")]
    NoAvailableStreamIds,

    #[error("Control connection closed")]
    ConnectionClosed,

    #[error("Receive loop already running")]
    AlreadyRunning,
}

impl MuxError {
    /// Whether this error means the peer broke the protocol (as opposed to an
    /// I/O failure or an orderly close)
    pub fn is_protocol_error(&self) -> bool {
        match self {
            MuxError::Codec(CodecError::Io(_)) => false,
            MuxError::Codec(_)
            | MuxError::UnexpectedControl(_)
            | MuxError::UnexpectedOpen(_)
            | MuxError::StreamAlreadyExists(_) => true,
            _ => false,
        }
    }
}

/// Which end of the control connection this multiplexer runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Router side: opens streams, never accepts them
    Server,
    /// Client side: accepts streams opened by the router
    Client,
}

/// Multiplexer tuning
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Data frames buffered per stream before the receive loop waits
    pub stream_queue: usize,
    /// Frames buffered in front of the writer task
    pub writer_queue: usize,
    /// Streams opened by the peer that have not been accepted yet
    pub accept_queue: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            stream_queue: 64,
            writer_queue: 256,
            accept_queue: 128,
        }
    }
}

/// Entry in the stream table
struct StreamSlot {
    tx: mpsc::Sender<Bytes>,
    reset: Arc<AtomicBool>,
}

/// A control connection carrying many logical streams
pub struct MultiplexedConnection {
    role: Role,
    config: MuxConfig,
    next_stream_id: AtomicU32,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    frame_tx: mpsc::Sender<Frame>,
    reader: tokio::sync::Mutex<Option<FrameReader>>,
    incoming_tx: mpsc::Sender<MuxStream>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    shutdown: CancellationToken,
}

impl MultiplexedConnection {
    /// Take over an already-handshaken connection.
    ///
    /// Raises the reader's frame limit to the full frame size. Spawns the
    /// writer task immediately; the caller drives the receive side
    /// with [`run_receive_loop`](Self::run_receive_loop).
    pub fn new(mut reader: FrameReader, writer: FrameWriter, role: Role, config: MuxConfig) -> Arc<Self> {
        reader.decoder_mut().finish_handshake();

        let (frame_tx, frame_rx) = mpsc::channel(config.writer_queue);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_queue);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_writer(writer, frame_rx, shutdown.clone()));

        Arc::new(Self {
            role,
            config,
            next_stream_id: AtomicU32::new(1), // Stream 0 is reserved for control
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            reader: tokio::sync::Mutex::new(Some(reader)),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            shutdown,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Open a new stream towards the peer (router side).
    ///
    /// Allocates a fresh stream ID and queues the OPEN frame. Stream IDs grow
    /// monotonically and are never handed out twice on one connection.
    pub async fn open_stream(self: &Arc<Self>) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed);
        }

        let stream_id = self.allocate_stream_id()?;
        let stream = self.register_stream(stream_id)?;

        if let Err(e) = self.send_frame(Frame::open(stream_id)).await {
            self.release(stream_id);
            return Err(e);
        }

        debug!("Opened stream {}", stream_id);
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer (client side).
    ///
    /// Returns `None` once the connection is closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut incoming = self.incoming_rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            stream = incoming.recv() => stream,
        }
    }

    /// Queue a frame for the writer task
    pub async fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| MuxError::ConnectionClosed)
    }

    /// Queue a control message
    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), MuxError> {
        trace!("Sending control message: {}", msg.kind());
        self.send_frame(ControlCodec::encode(msg)?).await
    }

    /// Queue a keepalive ping unless the writer queue is full.
    ///
    /// Returns `Ok(false)` when the ping was skipped. Never waits, so a
    /// caller that also drives the receive loop keeps reading.
    pub fn try_ping(&self) -> Result<bool, MuxError> {
        let frame = ControlCodec::encode(&ControlMessage::Ping {
            timestamp: unix_millis(),
        })?;
        match self.frame_tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MuxError::ConnectionClosed),
        }
    }

    /// Close the connection and every stream on it
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing control connection");
        }
        self.shutdown.cancel();
        // Dropping the senders ends every stream's read side
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Number of streams currently open
    pub fn active_streams(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether `stream_id` is still in the stream table
    pub fn is_stream_open(&self, stream_id: StreamId) -> bool {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&stream_id)
    }

    /// Remove a stream from the table if it is still present.
    ///
    /// Returns `true` when this call removed it, meaning the caller is the one
    /// that must tell the peer.
    pub fn release(&self, stream_id: StreamId) -> bool {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream_id)
            .is_some()
    }

    /// Run the receive loop until the connection fails or is closed.
    ///
    /// Returns `Ok(())` after [`close`](Self::close); otherwise the error that
    /// ended the connection. Either way every stream is closed on return.
    pub async fn run_receive_loop(self: Arc<Self>) -> Result<(), MuxError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(MuxError::AlreadyRunning)?;

        debug!("Starting receive loop ({:?})", self.role);

        let result = loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                next = reader.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(MuxError::from(e)),
                None => break Err(MuxError::ConnectionClosed),
            };

            if let Err(e) = self.dispatch(frame).await {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => debug!("Receive loop stopped"),
            Err(e) if e.is_protocol_error() => warn!("Control connection protocol error: {}", e),
            Err(e) => debug!("Receive loop ended: {}", e),
        }

        self.close();
        result
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        match frame.frame_type {
            FrameType::Control => self.handle_control(ControlCodec::decode(&frame)?).await,
            FrameType::Open => self.handle_open(frame.stream_id).await,
            FrameType::Data => {
                self.handle_data(frame.stream_id, frame.payload).await;
                Ok(())
            }
            FrameType::Close => {
                self.handle_close(frame.stream_id, frame.flags.has_rst());
                Ok(())
            }
        }
    }

    async fn handle_control(&self, msg: ControlMessage) -> Result<(), MuxError> {
        match msg {
            ControlMessage::Ping { timestamp } => {
                trace!("Ping {}", timestamp);
                self.send_control(&ControlMessage::Pong { timestamp }).await
            }
            ControlMessage::Pong { timestamp } => {
                trace!("Pong {} ({}ms)", timestamp, unix_millis().saturating_sub(timestamp));
                Ok(())
            }
            other => Err(MuxError::UnexpectedControl(other.kind())),
        }
    }

    async fn handle_open(self: &Arc<Self>, stream_id: StreamId) -> Result<(), MuxError> {
        if self.role == Role::Server {
            return Err(MuxError::UnexpectedOpen(stream_id));
        }

        let stream = self.register_stream(stream_id)?;
        debug!("Peer opened stream {}", stream_id);

        // The receiver lives as long as `self`, so this only waits for room
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.incoming_tx.send(stream) => {}
        }

        Ok(())
    }

    async fn handle_data(&self, stream_id: StreamId, payload: Bytes) {
        let tx = {
            let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.get(&stream_id).map(|slot| slot.tx.clone())
        };

        let Some(tx) = tx else {
            trace!("Dropping {} bytes for closed stream {}", payload.len(), stream_id);
            return;
        };

        trace!("Received {} bytes on stream {}", payload.len(), stream_id);

        // Waiting here is what makes a stalled stream hold up the others
        let sent = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            sent = tx.send(payload) => sent,
        };

        if sent.is_err() {
            // Reader is gone without having released the stream yet
            self.release(stream_id);
        }
    }

    fn handle_close(&self, stream_id: StreamId, reset: bool) {
        let slot = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream_id);

        match slot {
            Some(slot) => {
                if reset {
                    slot.reset.store(true, Ordering::Release);
                    debug!("Peer reset stream {}", stream_id);
                } else {
                    debug!("Peer closed stream {}", stream_id);
                }
            }
            None => trace!("Close for unknown stream {}", stream_id),
        }
    }

    fn allocate_stream_id(&self) -> Result<StreamId, MuxError> {
        self.next_stream_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                if id == StreamId::MAX {
                    None
                } else {
                    Some(id + 1)
                }
            })
            .map_err(|_| MuxError::NoAvailableStreamIds)
    }

    fn register_stream(self: &Arc<Self>, stream_id: StreamId) -> Result<MuxStream, MuxError> {
        debug_assert_ne!(stream_id, CONTROL_STREAM_ID);

        let (tx, rx) = mpsc::channel(self.config.stream_queue);
        let reset = Arc::new(AtomicBool::new(false));

        {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            if streams.contains_key(&stream_id) {
                return Err(MuxError::StreamAlreadyExists(stream_id));
            }
            streams.insert(
                stream_id,
                StreamSlot {
                    tx,
                    reset: reset.clone(),
                },
            );
        }

        Ok(MuxStream {
            stream_id,
            sender: PollSender::new(self.frame_tx.clone()),
            connection: self.clone(),
            rx,
            reset,
            pending: Bytes::new(),
            closed: false,
        })
    }
}

impl Drop for MultiplexedConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Writer task: the only place frames are written to the socket
async fn run_writer(mut writer: FrameWriter, mut rx: mpsc::Receiver<Frame>, shutdown: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = shutdown.cancelled() => break,
            written = write_batch(&mut writer, &mut rx, frame) => written,
        };

        if let Err(e) = written {
            debug!("Control connection write failed: {}", e);
            break;
        }
    }

    shutdown.cancel();
    // A stalled peer must not keep the socket alive
    let _ = tokio::time::timeout(WRITER_CLOSE_TIMEOUT, writer.close()).await;
    trace!("Writer task stopped");
}

/// Write `first` plus whatever else is already queued, then flush once
async fn write_batch(
    writer: &mut FrameWriter,
    rx: &mut mpsc::Receiver<Frame>,
    first: Frame,
) -> Result<(), CodecError> {
    writer.feed(first).await?;
    while let Ok(frame) = rx.try_recv() {
        writer.feed(frame).await?;
    }
    writer.flush().await
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

/// One logical stream on a [`MultiplexedConnection`].
///
/// Reads yield the payloads of DATA frames in arrival order and end with EOF
/// when the peer sends CLOSE (or with `ConnectionReset` when it sends a
/// reset). Writes become DATA frames. Shutting down the write side sends
/// CLOSE unless the peer closed the stream first.
pub struct MuxStream {
    stream_id: StreamId,
    connection: Arc<MultiplexedConnection>,
    rx: mpsc::Receiver<Bytes>,
    reset: Arc<AtomicBool>,
    pending: Bytes,
    sender: PollSender<Frame>,
    closed: bool,
}

impl MuxStream {
    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    pub fn connection(&self) -> &Arc<MultiplexedConnection> {
        &self.connection
    }

    /// Abort the stream, telling the peer it failed
    pub async fn reset(mut self) -> Result<(), MuxError> {
        self.closed = true;
        if self.connection.release(self.stream_id) {
            self.connection
                .send_frame(Frame::reset(self.stream_id))
                .await?;
        }
        Ok(())
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(data) => this.pending = data,
                None => {
                    if this.reset.load(Ordering::Acquire) {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "stream reset by peer",
                        )));
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed || !this.connection.is_stream_open(this.stream_id) {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.sender.poll_reserve(cx)).map_err(|_| broken_pipe())?;

        let n = buf.len().min(MAX_DATA_CHUNK);
        let frame = Frame::data(this.stream_id, Bytes::copy_from_slice(&buf[..n]));
        this.sender.send_item(frame).map_err(|_| broken_pipe())?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        if this.connection.is_stream_open(this.stream_id) {
            match ready!(this.sender.poll_reserve(cx)) {
                Ok(()) => {
                    if this.connection.release(this.stream_id) {
                        let _ = this.sender.send_item(Frame::close(this.stream_id));
                        debug!("Closed stream {}", this.stream_id);
                    } else {
                        this.sender.abort_send();
                    }
                }
                Err(_) => {
                    this.connection.release(this.stream_id);
                }
            }
        }

        this.closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if self.closed || !self.connection.release(self.stream_id) {
            return;
        }

        // Dropped without shutdown: still owe the peer a CLOSE
        let frame = Frame::close(self.stream_id);
        if let Err(mpsc::error::TrySendError::Full(frame)) = self.connection.frame_tx.try_send(frame)
        {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let tx = self.connection.frame_tx.clone();
                handle.spawn(async move {
                    let _ = tx.send(frame).await;
                });
            }
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::framed;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (Arc<MultiplexedConnection>, Arc<MultiplexedConnection>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (a_read, a_write) = framed(a);
        let (b_read, b_write) = framed(b);
        let server =
            MultiplexedConnection::new(a_read, a_write, Role::Server, MuxConfig::default());
        let client =
            MultiplexedConnection::new(b_read, b_write, Role::Client, MuxConfig::default());
        tokio::spawn(server.clone().run_receive_loop());
        tokio::spawn(client.clone().run_receive_loop());
        (server, client)
    }

    #[tokio::test]
    async fn test_open_and_exchange() {
        let (server, client) = pair();

        let mut s = server.open_stream().await.unwrap();
        let mut c = client.accept_stream().await.unwrap();
        assert_eq!(s.id(), c.id());

        s.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        c.write_all(b"world").await.unwrap();
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_stream_ids_are_monotonic() {
        let (server, client) = pair();

        let first = server.open_stream().await.unwrap();
        let second = server.open_stream().await.unwrap();
        let first_id = first.id();
        drop(first);
        let third = server.open_stream().await.unwrap();

        assert_eq!(first_id, 1);
        assert_eq!(second.id(), 2);
        assert_eq!(third.id(), 3);

        let _ = client;
    }

    #[tokio::test]
    async fn test_close_reaches_peer_as_eof() {
        let (server, client) = pair();

        let mut s = server.open_stream().await.unwrap();
        let mut c = client.accept_stream().await.unwrap();

        s.write_all(b"bye").await.unwrap();
        s.shutdown().await.unwrap();

        let mut out = Vec::new();
        c.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
        assert_eq!(server.active_streams(), 0);

        // Peer already removed the entry, so its shutdown sends nothing back
        c.shutdown().await.unwrap();
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_reset_surfaces_as_connection_reset() {
        let (server, client) = pair();

        let mut s = server.open_stream().await.unwrap();
        let c = client.accept_stream().await.unwrap();
        c.reset().await.unwrap();

        let mut buf = [0u8; 1];
        let err = s.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_close_connection_ends_streams() {
        let (server, client) = pair();

        let mut s = server.open_stream().await.unwrap();
        let mut c = client.accept_stream().await.unwrap();

        server.close();

        let mut buf = [0u8; 1];
        assert_eq!(s.read(&mut buf).await.unwrap(), 0);
        assert!(s.write_all(b"x").await.is_err());

        // Client notices the socket going away
        client.closed().await;
        assert_eq!(c.read(&mut buf).await.unwrap(), 0);
        assert!(client.accept_stream().await.is_none());
    }

    #[tokio::test]
    async fn test_server_rejects_open_from_peer() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = framed(a);
        let (_b_read, mut b_write) = framed(b);
        let server =
            MultiplexedConnection::new(a_read, a_write, Role::Server, MuxConfig::default());

        b_write.send(Frame::open(1)).await.unwrap();

        let err = server.clone().run_receive_loop().await.unwrap_err();
        assert!(matches!(err, MuxError::UnexpectedOpen(1)));
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_duplicate_open_is_protocol_error() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = framed(a);
        let (_b_read, mut b_write) = framed(b);
        let client =
            MultiplexedConnection::new(a_read, a_write, Role::Client, MuxConfig::default());

        b_write.send(Frame::open(4)).await.unwrap();
        b_write.send(Frame::open(4)).await.unwrap();

        let run = tokio::spawn(client.clone().run_receive_loop());
        let _first = client.accept_stream().await.unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, MuxError::StreamAlreadyExists(4)));
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = framed(a);
        let (mut b_read, mut b_write) = framed(b);
        let client =
            MultiplexedConnection::new(a_read, a_write, Role::Client, MuxConfig::default());
        tokio::spawn(client.clone().run_receive_loop());

        crate::write_control(&mut b_write, &ControlMessage::Ping { timestamp: 42 })
            .await
            .unwrap();

        let reply = crate::read_control(&mut b_read).await.unwrap();
        assert_eq!(reply, ControlMessage::Pong { timestamp: 42 });
    }

    #[tokio::test]
    async fn test_try_ping_skips_when_writer_is_backed_up() {
        // The peer never reads, so the writer stalls and its queue fills
        let (a, _b) = tokio::io::duplex(64);
        let (a_read, a_write) = framed(a);
        let config = MuxConfig {
            writer_queue: 1,
            ..MuxConfig::default()
        };
        let conn = MultiplexedConnection::new(a_read, a_write, Role::Client, config);

        let mut skipped = false;
        for _ in 0..100 {
            if !conn.try_ping().unwrap() {
                skipped = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(skipped);

        conn.close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.try_ping().is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("ping still accepted after close");
    }

    #[tokio::test]
    async fn test_data_for_unknown_stream_is_ignored() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = framed(a);
        let (mut b_read, mut b_write) = framed(b);
        let client =
            MultiplexedConnection::new(a_read, a_write, Role::Client, MuxConfig::default());
        tokio::spawn(client.clone().run_receive_loop());

        b_write
            .send(Frame::data(99, Bytes::from_static(b"late")))
            .await
            .unwrap();
        b_write.send(Frame::close(99)).await.unwrap();

        // Connection is still usable afterwards
        crate::write_control(&mut b_write, &ControlMessage::Ping { timestamp: 1 })
            .await
            .unwrap();
        let reply = crate::read_control(&mut b_read).await.unwrap();
        assert_eq!(reply, ControlMessage::Pong { timestamp: 1 });
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_large_writes_are_chunked() {
        let (server, client) = pair();

        let mut s = server.open_stream().await.unwrap();
        let mut c = client.accept_stream().await.unwrap();

        let payload: Vec<u8> = (0..(MAX_DATA_CHUNK * 3 + 17)).map(|i| i as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            s.write_all(&payload).await.unwrap();
            s.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        c.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, expected);
        writer.await.unwrap();
    }
}
