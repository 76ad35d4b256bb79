//! Byte relay between a tunnel stream and a local connection

use crate::tunnel::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Read buffer for the local-to-tunnel direction
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Relay bytes between `stream` and `local` until either direction ends.
///
/// Whichever direction finishes first aborts the other; the stream is then
/// closed and the local connection dropped.
pub async fn bridge<L>(stream: Stream, local: L)
where
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let stream_id = stream.id();
    let (mut reader, writer) = stream.into_split();
    let (mut local_read, mut local_write) = tokio::io::split(local);

    // Task to read from the tunnel and write to the local connection
    let mut tunnel_to_local = tokio::spawn(async move {
        let mut total = 0u64;
        while let Some(chunk) = reader.read().await {
            if let Err(e) = local_write.write_all(&chunk).await {
                debug!("Stream {} local write failed: {}", stream_id, e);
                return total;
            }
            total += chunk.len() as u64;
        }
        // Stream closed: pass the EOF on
        if let Err(e) = local_write.shutdown().await {
            trace!("Stream {} local shutdown failed: {}", stream_id, e);
        }
        total
    });

    // Task to read from the local connection and write to the tunnel
    let upstream = writer.clone();
    let mut local_to_tunnel = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            match local_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = upstream.write(&buf[..n]).await {
                        debug!("Stream {} tunnel write failed: {}", stream_id, e);
                        break;
                    }
                    total += n as u64;
                }
                Err(e) => {
                    debug!("Stream {} local read error: {}", stream_id, e);
                    break;
                }
            }
        }
        total
    });

    // Wait for either direction to complete
    tokio::select! {
        res = &mut tunnel_to_local => {
            local_to_tunnel.abort();
            trace!("Stream {} tunnel->local done: {:?} bytes", stream_id, res.ok());
        }
        res = &mut local_to_tunnel => {
            tunnel_to_local.abort();
            trace!("Stream {} local->tunnel done: {:?} bytes", stream_id, res.ok());
        }
    }

    if let Err(e) = writer.close().await {
        trace!("Stream {} close after bridge: {}", stream_id, e);
    }
    debug!("Stream {} bridge finished", stream_id);
}
