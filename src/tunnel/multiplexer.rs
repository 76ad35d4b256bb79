//! Stream multiplexer for the tunnel
//!
//! Manages multiple logical streams over a single secure channel. One read
//! loop task per channel decodes frames and routes them to stream queues;
//! one writer task drains an outbound queue of encoded frames, so frames
//! never interleave and a cancelled sender never tears one.

use super::stream::StreamEntry;
use super::{Frame, FrameType, Stream, TunnelError, ACCEPT_BACKLOG, OUTBOUND_QUEUE_CAPACITY};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, trace, warn};

/// Side of the tunnel a multiplexer runs on.
///
/// Each side owns one half of the stream id space: the dialer opens odd ids,
/// the listener opens even ids, so both may open streams without collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the underlying connection ("iran")
    Dialer,
    /// Accepted the underlying connection ("outside")
    Listener,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Dialer => 1,
            Role::Listener => 2,
        }
    }

    /// Whether `stream_id` is in this side's id namespace
    pub fn owns(self, stream_id: u32) -> bool {
        stream_id != 0 && (stream_id % 2 == 1) == (self == Role::Dialer)
    }
}

/// Why a multiplexer stopped
#[derive(Debug, Clone)]
pub enum Shutdown {
    /// The peer closed the channel on a frame boundary
    PeerClosed,
    /// The channel failed (I/O error, torn or malformed frame)
    Failed(Arc<TunnelError>),
}

/// Messages for the writer task
enum Outbound {
    /// One fully encoded frame
    Frame(Bytes),
    /// Flush, close the write side and stop
    Shutdown(Option<oneshot::Sender<io::Result<()>>>),
}

/// State shared between the multiplexer handles, its read loop and streams
pub(super) struct Shared {
    role: Role,
    /// Queue drained by the writer task
    outbound: mpsc::Sender<Outbound>,
    /// Serialises stream table access
    table: Mutex<StreamTable>,
    shutdown_tx: watch::Sender<Option<Shutdown>>,
}

struct StreamTable {
    streams: HashMap<u32, StreamEntry>,
    /// `None` once the id space is used up
    next_id: Option<u32>,
    closed: bool,
}

impl StreamTable {
    fn allocate(&mut self) -> Result<u32, TunnelError> {
        let id = self.next_id.ok_or(TunnelError::IdsExhausted)?;
        self.next_id = id.checked_add(2);
        Ok(id)
    }
}

impl Shared {
    /// Queue one frame for the writer task.
    ///
    /// Cancel-safe: the frame is either queued whole or not at all.
    pub(super) async fn send_frame(&self, frame: &Frame) -> Result<(), TunnelError> {
        trace!(
            "Sending frame type {:?} stream {} ({} bytes)",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );
        self.outbound
            .send(Outbound::Frame(frame.encode().freeze()))
            .await
            .map_err(|_| TunnelError::ChannelClosed)
    }

    /// Remove a stream from the table; returns whether it was present
    pub(super) async fn release(&self, stream_id: u32) -> bool {
        self.table.lock().await.streams.remove(&stream_id).is_some()
    }

    async fn deliver(&self, stream_id: u32, payload: Bytes) {
        let inbound = self
            .table
            .lock()
            .await
            .streams
            .get(&stream_id)
            .map(|entry| entry.inbound.clone());

        match inbound {
            // A full queue blocks here, and with it the whole channel
            Some(inbound) => {
                if inbound.send(payload).await.is_err() {
                    trace!("Reader of stream {} is gone, dropping data", stream_id);
                }
            }
            None => trace!("Dropping data frame: {}", TunnelError::UnknownStream(stream_id)),
        }
    }

    async fn accept_remote(
        self: &Arc<Self>,
        stream_id: u32,
        payload: Bytes,
        incoming: &mpsc::Sender<Stream>,
    ) {
        if self.role.owns(stream_id) {
            if self.table.lock().await.streams.contains_key(&stream_id) {
                warn!("Peer opened our live stream {}, ignoring", stream_id);
            } else {
                warn!(
                    "Peer opened stream {} inside our id namespace, refusing",
                    stream_id
                );
                self.send_in_background(Frame::close(stream_id));
            }
            return;
        }

        let service = String::from_utf8_lossy(&payload).into_owned();
        let stream = {
            let mut table = self.table.lock().await;
            if table.streams.contains_key(&stream_id) {
                warn!("Peer reopened live stream {}, ignoring", stream_id);
                return;
            }
            let (stream, entry) = Stream::new(stream_id, service, self);
            table.streams.insert(stream_id, entry);
            stream
        };

        debug!(
            "Peer opened stream {} (service {:?})",
            stream_id,
            stream.service()
        );

        // Dropping a refused stream closes it towards the peer
        match incoming.try_send(stream) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Accept backlog full, refusing stream {}", stream_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Nobody accepts streams, refusing stream {}", stream_id);
            }
        }
    }

    /// Write a frame without holding up the read loop
    fn send_in_background(self: &Arc<Self>, frame: Frame) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = shared.send_frame(&frame).await {
                debug!(
                    "Failed to send {:?} for stream {}: {}",
                    frame.frame_type, frame.stream_id, e
                );
            }
        });
    }

    async fn close_remote(&self, stream_id: u32) {
        match self.table.lock().await.streams.remove(&stream_id) {
            Some(entry) => {
                entry.closed.store(true, Ordering::Release);
                debug!("Peer closed stream {}", stream_id);
            }
            None => trace!("Close for unknown stream {}", stream_id),
        }
    }

    /// Close every stream and publish the shutdown reason
    async fn teardown(&self, reason: Shutdown) {
        let streams = {
            let mut table = self.table.lock().await;
            table.closed = true;
            std::mem::take(&mut table.streams)
        };

        if !streams.is_empty() {
            debug!("Closing {} stream(s) after channel shutdown", streams.len());
        }
        // Dropping the entries drops every inbound sender, which wakes readers
        for entry in streams.into_values() {
            entry.closed.store(true, Ordering::Release);
        }

        self.shutdown_tx.send_replace(Some(reason));

        if self.outbound.try_send(Outbound::Shutdown(None)).is_err() {
            trace!("Writer task busy or gone, not queueing shutdown");
        }
    }
}

/// Stream multiplexer over one secure channel.
///
/// Cloning yields another handle to the same multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
    incoming: Arc<Mutex<mpsc::Receiver<Stream>>>,
    shutdown_rx: watch::Receiver<Option<Shutdown>>,
}

impl Multiplexer {
    /// Take ownership of `io` and start the read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(io: S, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let shared = Arc::new(Shared {
            role,
            outbound: outbound_tx,
            table: Mutex::new(StreamTable {
                streams: HashMap::new(),
                next_id: Some(role.first_stream_id()),
                closed: false,
            }),
            shutdown_tx,
        });

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(reader, Arc::clone(&shared), incoming_tx));

        Self {
            shared,
            incoming: Arc::new(Mutex::new(incoming_rx)),
            shutdown_rx,
        }
    }

    /// Side of the tunnel this multiplexer runs on
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open a stream to the peer's default destination
    pub async fn open(&self) -> Result<Stream, TunnelError> {
        self.open_service("").await
    }

    /// Open a stream to a named service on the peer.
    ///
    /// Returns as soon as the `Open` frame is written; the peer does not
    /// acknowledge it.
    pub async fn open_service(&self, service: &str) -> Result<Stream, TunnelError> {
        let stream = {
            let mut table = self.shared.table.lock().await;
            if table.closed {
                return Err(TunnelError::ChannelClosed);
            }
            let stream_id = table.allocate()?;
            let (stream, entry) = Stream::new(stream_id, service.to_string(), &self.shared);
            table.streams.insert(stream_id, entry);
            stream
        };

        let stream_id = stream.id();
        if let Err(e) = self
            .shared
            .send_frame(&Frame::open(stream_id, service.as_bytes()))
            .await
        {
            self.shared.release(stream_id).await;
            return Err(e);
        }

        debug!("Opened stream {} (service {:?})", stream_id, service);
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// Returns `None` once the channel has shut down.
    pub async fn accept(&self) -> Option<Stream> {
        self.incoming.lock().await.recv().await
    }

    /// Wait until the read loop has stopped
    pub async fn closed(&self) -> Shutdown {
        let mut rx = self.shutdown_rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(Shutdown::PeerClosed),
            Err(_) => Shutdown::PeerClosed,
        };
        reason
    }

    /// Whether the read loop has stopped
    pub fn is_closed(&self) -> bool {
        self.shutdown_rx.borrow().is_some()
    }

    /// Get number of live streams
    pub async fn stream_count(&self) -> usize {
        self.shared.table.lock().await.streams.len()
    }

    /// Close the write side of the channel.
    ///
    /// Frames queued before the call are written first. The peer sees
    /// end-of-channel and tears down, which in turn ends our read loop.
    pub async fn shutdown(&self) -> Result<(), TunnelError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.shared
            .outbound
            .send(Outbound::Shutdown(Some(done_tx)))
            .await
            .map_err(|_| TunnelError::ChannelClosed)?;
        done_rx.await.map_err(|_| TunnelError::ChannelClosed)??;
        Ok(())
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(encoded) => {
                let written = match writer.write_all(&encoded).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    warn!("Channel write failed: {}", e);
                    break;
                }
            }
            Outbound::Shutdown(done) => {
                let result = writer.shutdown().await;
                if let Err(e) = &result {
                    trace!("Channel writer shutdown failed: {}", e);
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
                break;
            }
        }
    }
    trace!("Writer task stopped");
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, incoming: mpsc::Sender<Stream>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reason = loop {
        let frame = match Frame::read_from(&mut reader).await {
            Ok(frame) => frame,
            Err(TunnelError::TruncatedFrame { received: 0, .. }) => {
                debug!("Peer closed the channel");
                break Shutdown::PeerClosed;
            }
            Err(e) => {
                warn!("Channel read failed: {}", e);
                break Shutdown::Failed(Arc::new(e));
            }
        };

        trace!(
            "Received frame: type={:?} stream={} payload={} bytes",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Data => shared.deliver(frame.stream_id, frame.payload).await,
            FrameType::Open => {
                shared
                    .accept_remote(frame.stream_id, frame.payload, &incoming)
                    .await
            }
            FrameType::Close => shared.close_remote(frame.stream_id).await,
        }
    };

    drop(incoming);
    shared.teardown(reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn pair(role: Role) -> (Multiplexer, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        (Multiplexer::new(local, role), remote)
    }

    #[test]
    fn test_role_id_namespaces() {
        assert_eq!(Role::Dialer.first_stream_id(), 1);
        assert_eq!(Role::Listener.first_stream_id(), 2);
        assert!(Role::Dialer.owns(7));
        assert!(!Role::Dialer.owns(8));
        assert!(Role::Listener.owns(8));
        assert!(!Role::Listener.owns(0));
    }

    #[test]
    fn test_id_allocation_exhausts() {
        let mut table = StreamTable {
            streams: HashMap::new(),
            next_id: Some(u32::MAX - 2),
            closed: false,
        };
        assert_eq!(table.allocate().unwrap(), u32::MAX - 2);
        assert_eq!(table.allocate().unwrap(), u32::MAX);
        assert!(matches!(table.allocate(), Err(TunnelError::IdsExhausted)));
    }

    #[tokio::test]
    async fn test_open_sends_open_frame() {
        let (mux, mut remote) = pair(Role::Dialer);

        let first = mux.open().await.unwrap();
        let second = mux.open_service("ssh").await.unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 3);
        assert_eq!(mux.stream_count().await, 2);

        let frame = Frame::read_from(&mut remote).await.unwrap();
        assert_eq!(frame, Frame::open(1, b""));
        let frame = Frame::read_from(&mut remote).await.unwrap();
        assert_eq!(frame, Frame::open(3, b"ssh"));
    }

    #[tokio::test]
    async fn test_write_produces_data_frame() {
        let (mux, mut remote) = pair(Role::Listener);
        let stream = mux.open().await.unwrap();
        assert_eq!(stream.id(), 2);

        stream.write(b"hello").await.unwrap();
        stream.write(b"").await.unwrap();

        let _open = Frame::read_from(&mut remote).await.unwrap();
        let data = Frame::read_from(&mut remote).await.unwrap();
        assert_eq!(data, Frame::data(2, Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn test_inbound_data_routed_per_stream() {
        let (mux, mut remote) = pair(Role::Dialer);
        let mut a = mux.open().await.unwrap();
        let mut b = mux.open().await.unwrap();

        for (id, chunk) in [(1, "a1"), (3, "b1"), (3, "b2"), (1, "a2"), (1, "a3")] {
            Frame::data(id, Bytes::from(chunk))
                .write_to(&mut remote)
                .await
                .unwrap();
        }

        for want in ["a1", "a2", "a3"] {
            assert_eq!(a.read().await.unwrap(), want.as_bytes());
        }
        for want in ["b1", "b2"] {
            assert_eq!(b.read().await.unwrap(), want.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_unknown_stream_is_dropped() {
        let (mux, mut remote) = pair(Role::Dialer);
        let mut stream = mux.open().await.unwrap();

        Frame::data(99, Bytes::from_static(b"lost"))
            .write_to(&mut remote)
            .await
            .unwrap();
        Frame::close(77).write_to(&mut remote).await.unwrap();
        Frame::data(1, Bytes::from_static(b"kept"))
            .write_to(&mut remote)
            .await
            .unwrap();

        assert_eq!(stream.read().await.unwrap(), &b"kept"[..]);
        assert!(!mux.is_closed());
    }

    #[tokio::test]
    async fn test_remote_close_ends_stream() {
        let (mux, mut remote) = pair(Role::Dialer);
        let mut stream = mux.open().await.unwrap();

        Frame::data(1, Bytes::from_static(b"last"))
            .write_to(&mut remote)
            .await
            .unwrap();
        Frame::close(1).write_to(&mut remote).await.unwrap();

        assert_eq!(stream.read().await.unwrap(), &b"last"[..]);
        assert!(stream.read().await.is_none());
        assert!(stream.is_closed());
        assert_eq!(mux.stream_count().await, 0);
        assert!(matches!(
            stream.write(b"late").await,
            Err(TunnelError::StreamClosed)
        ));

        // Ids are never reused
        let next = mux.open().await.unwrap();
        assert_eq!(next.id(), 3);
    }

    #[tokio::test]
    async fn test_local_close_is_idempotent() {
        let (mux, mut remote) = pair(Role::Dialer);
        let mut stream = mux.open().await.unwrap();

        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.read().await.is_none());
        assert_eq!(mux.stream_count().await, 0);
        assert!(matches!(
            stream.write(b"x").await,
            Err(TunnelError::StreamClosed)
        ));

        let _open = Frame::read_from(&mut remote).await.unwrap();
        let close = Frame::read_from(&mut remote).await.unwrap();
        assert_eq!(close, Frame::close(1));

        // Only one close frame was sent
        mux.shutdown().await.unwrap();
        assert!(matches!(
            Frame::read_from(&mut remote).await,
            Err(TunnelError::TruncatedFrame { received: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_remote_streams() {
        let (mux, mut remote) = pair(Role::Dialer);

        // Odd ids belong to the dialer, so this one is ignored
        Frame::open(5, b"bogus").write_to(&mut remote).await.unwrap();
        Frame::open(4, b"ssh").write_to(&mut remote).await.unwrap();
        Frame::data(4, Bytes::from_static(b"hi"))
            .write_to(&mut remote)
            .await
            .unwrap();

        let mut stream = mux.accept().await.unwrap();
        assert_eq!(stream.id(), 4);
        assert_eq!(stream.service(), "ssh");
        assert_eq!(stream.read().await.unwrap(), &b"hi"[..]);
        assert_eq!(mux.stream_count().await, 1);

        // The bogus open was refused
        let refusal = Frame::read_from(&mut remote).await.unwrap();
        assert_eq!(refusal, Frame::close(5));
    }

    #[tokio::test]
    async fn test_full_accept_backlog_refuses_stream() {
        let (mux, mut remote) = pair(Role::Dialer);

        // Nobody calls accept(), so the last open overflows the backlog
        let last = 2 * (ACCEPT_BACKLOG as u32 + 1);
        for id in (2..=last).step_by(2) {
            Frame::open(id, b"").write_to(&mut remote).await.unwrap();
        }

        let refusal = Frame::read_from(&mut remote).await.unwrap();
        assert_eq!(refusal, Frame::close(last));
        assert_eq!(mux.stream_count().await, ACCEPT_BACKLOG);

        // The read loop keeps routing frames
        Frame::data(2, Bytes::from_static(b"queued"))
            .write_to(&mut remote)
            .await
            .unwrap();
        let mut first = mux.accept().await.unwrap();
        assert_eq!(first.id(), 2);
        assert_eq!(first.read().await.unwrap(), &b"queued"[..]);
    }

    #[tokio::test]
    async fn test_cancelled_write_leaves_frames_intact() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mux = Multiplexer::new(local, Role::Dialer);
        let a = mux.open().await.unwrap();
        let b = mux.open().await.unwrap();

        // The peer is not reading yet, so this write may stall mid-frame
        let _ = tokio::time::timeout(Duration::from_millis(50), a.write(&[0xAA; 4096])).await;
        b.write(b"ok").await.unwrap();

        assert_eq!(Frame::read_from(&mut remote).await.unwrap(), Frame::open(1, b""));
        assert_eq!(Frame::read_from(&mut remote).await.unwrap(), Frame::open(3, b""));
        loop {
            let frame = Frame::read_from(&mut remote).await.unwrap();
            assert_eq!(frame.frame_type, FrameType::Data);
            if frame.stream_id == 3 {
                assert_eq!(frame.payload, &b"ok"[..]);
                break;
            }
            assert_eq!(frame.stream_id, 1);
            assert_eq!(frame.payload.len(), 4096);
            assert!(frame.payload.iter().all(|&byte| byte == 0xAA));
        }
    }

    #[tokio::test]
    async fn test_channel_close_cascades() {
        let (mux, remote) = pair(Role::Listener);
        let mut a = mux.open().await.unwrap();
        let mut b = mux.open().await.unwrap();

        drop(remote);

        let cascade = async {
            assert!(a.read().await.is_none());
            assert!(b.read().await.is_none());
            mux.closed().await
        };
        let reason = tokio::time::timeout(Duration::from_secs(5), cascade)
            .await
            .expect("streams were not closed");

        assert!(matches!(reason, Shutdown::PeerClosed));
        assert!(mux.is_closed());
        assert!(mux.accept().await.is_none());
        assert!(matches!(mux.open().await, Err(TunnelError::ChannelClosed)));
        assert!(matches!(a.write(b"x").await, Err(TunnelError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (mux, mut remote) = pair(Role::Dialer);
        let mut stream = mux.open().await.unwrap();

        remote
            .write_all(&[0x7F, 0, 0, 0, 1, 0, 0, 0, 0])
            .await
            .unwrap();

        assert!(stream.read().await.is_none());
        match mux.closed().await {
            Shutdown::Failed(e) => assert!(matches!(*e, TunnelError::InvalidFrame(_))),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_torn_frame_is_fatal() {
        let (mux, mut remote) = pair(Role::Dialer);

        let encoded = Frame::data(1, Bytes::from_static(b"0123456789")).encode();
        remote.write_all(&encoded[..12]).await.unwrap();
        drop(remote);

        match mux.closed().await {
            Shutdown::Failed(e) => {
                assert!(matches!(*e, TunnelError::TruncatedFrame { received: 12, .. }))
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
