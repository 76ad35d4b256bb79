//! Multiplexed stream implementation

use super::multiplexer::Shared;
use super::{Frame, TunnelError, INBOUND_QUEUE_CAPACITY, MAX_PAYLOAD_SIZE};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Multiplexer-side record of a live stream
pub(super) struct StreamEntry {
    pub(super) inbound: mpsc::Sender<Bytes>,
    pub(super) closed: Arc<AtomicBool>,
}

/// A logical, ordered byte pipe multiplexed over the tunnel.
///
/// Dropping every handle of a stream without calling `close` closes it in
/// the background.
pub struct Stream {
    service: String,
    reader: StreamReader,
    writer: StreamWriter,
}

/// Receiving half of a [`Stream`]
pub struct StreamReader {
    inbound: mpsc::Receiver<Bytes>,
    handle: Arc<StreamHandle>,
}

/// Sending half of a [`Stream`]; clones share the closed state
#[derive(Clone)]
pub struct StreamWriter {
    handle: Arc<StreamHandle>,
}

/// State shared by every handle of one stream
struct StreamHandle {
    stream_id: u32,
    closed: Arc<AtomicBool>,
    mux: Weak<Shared>,
}

impl Stream {
    pub(super) fn new(stream_id: u32, service: String, mux: &Arc<Shared>) -> (Self, StreamEntry) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(StreamHandle {
            stream_id,
            closed: Arc::clone(&closed),
            mux: Arc::downgrade(mux),
        });

        let stream = Self {
            service,
            reader: StreamReader {
                inbound: inbound_rx,
                handle: Arc::clone(&handle),
            },
            writer: StreamWriter { handle },
        };
        let entry = StreamEntry {
            inbound: inbound_tx,
            closed,
        };
        (stream, entry)
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.writer.id()
    }

    /// Service name carried by the stream's `Open` frame (empty for the default)
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Receive the next chunk; `None` once the stream is closed and drained
    pub async fn read(&mut self) -> Option<Bytes> {
        self.reader.read().await
    }

    /// Send data on this stream
    pub async fn write(&self, data: &[u8]) -> Result<(), TunnelError> {
        self.writer.write(data).await
    }

    /// Close this stream
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.writer.close().await
    }

    /// Whether either side has closed the stream
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Split into independently usable halves.
    ///
    /// The stream stays open until `close` is called or both halves (and
    /// every writer clone) are dropped.
    pub fn into_split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

impl StreamReader {
    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.handle.stream_id
    }

    /// Receive the next chunk; `None` once the stream is closed and drained
    pub async fn read(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

impl StreamWriter {
    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.handle.stream_id
    }

    /// Whether either side has closed the stream
    pub fn is_closed(&self) -> bool {
        self.handle.closed.load(Ordering::Acquire)
    }

    /// Send data, split into as many data frames as needed.
    ///
    /// Cancelling this future never tears a frame; frames already queued
    /// are sent in full.
    pub async fn write(&self, data: &[u8]) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::StreamClosed);
        }
        let mux = self.handle.mux.upgrade().ok_or(TunnelError::ChannelClosed)?;

        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            mux.send_frame(&Frame::data(self.id(), Bytes::copy_from_slice(chunk)))
                .await?;
        }
        Ok(())
    }

    /// Send a close frame once and forget the stream.
    ///
    /// Later calls, and calls after the peer closed the stream, do nothing.
    pub async fn close(&self) -> Result<(), TunnelError> {
        if self.handle.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(mux) = self.handle.mux.upgrade() else {
            return Ok(());
        };

        mux.release(self.id()).await;
        mux.send_frame(&Frame::close(self.id())).await
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!("Stream {} dropped outside a runtime", self.stream_id);
            return;
        };

        let stream_id = self.stream_id;
        debug!("Stream {} dropped without close, closing", stream_id);
        runtime.spawn(async move {
            mux.release(stream_id).await;
            if let Err(e) = mux.send_frame(&Frame::close(stream_id)).await {
                trace!("Close for dropped stream {} not sent: {}", stream_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{Multiplexer, Role};

    #[tokio::test]
    async fn test_split_halves_share_close_state() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let mux = Multiplexer::new(local, Role::Dialer);

        let stream = mux.open_service("web").await.unwrap();
        assert_eq!(stream.service(), "web");
        let (mut reader, writer) = stream.into_split();
        let other = writer.clone();
        assert_eq!(reader.id(), other.id());

        other.close().await.unwrap();
        assert!(writer.is_closed());
        assert!(matches!(writer.write(b"x").await, Err(TunnelError::StreamClosed)));
        assert!(reader.read().await.is_none());

        let open = Frame::read_from(&mut remote).await.unwrap();
        assert_eq!(open, Frame::open(1, b"web"));
        let close = Frame::read_from(&mut remote).await.unwrap();
        assert_eq!(close, Frame::close(1));
    }

    #[tokio::test]
    async fn test_write_after_multiplexer_dropped() {
        let (local, remote) = tokio::io::duplex(1024);
        let mux = Multiplexer::new(local, Role::Listener);
        let mut stream = mux.open().await.unwrap();

        drop(mux);
        drop(remote);

        // The read loop tears down once the peer is gone
        assert!(stream.read().await.is_none());
        assert!(stream.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_stream_is_closed() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let mux = Multiplexer::new(local, Role::Dialer);

        let (reader, writer) = mux.open().await.unwrap().into_split();

        // The reader alone keeps the stream open
        drop(writer);
        assert_eq!(mux.stream_count().await, 1);

        drop(reader);
        assert_eq!(Frame::read_from(&mut remote).await.unwrap(), Frame::open(1, b""));
        assert_eq!(Frame::read_from(&mut remote).await.unwrap(), Frame::close(1));
        assert_eq!(mux.stream_count().await, 0);
    }
}
