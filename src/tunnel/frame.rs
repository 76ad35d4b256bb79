//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |          Stream ID (4B, BE)       |
//! +--------+--------+--------+--------+--------+
//! |        Payload Length (4B, BE)    |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest payload a peer may declare (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream data
    Data = 0x01,
    /// Stream open (payload: service name)
    Open = 0x02,
    /// Stream close
    Close = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Open),
            0x03 => Ok(FrameType::Close),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream open frame naming the requested service
    pub fn open(stream_id: u32, service: &[u8]) -> Self {
        Self {
            frame_type: FrameType::Open,
            stream_id,
            payload: Bytes::copy_from_slice(service),
        }
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a complete frame;
    /// nothing is consumed in that case.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let (frame_type, stream_id, payload_len) = parse_header(&buf[..FRAME_HEADER_SIZE])?;

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }

    /// Read exactly one frame from `reader`.
    ///
    /// The header is read completely before the payload. If the reader ends
    /// early this fails with [`TunnelError::TruncatedFrame`]; `received == 0`
    /// means the reader ended cleanly on a frame boundary.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, TunnelError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        read_full(reader, &mut header, 0).await?;

        let (frame_type, stream_id, payload_len) = parse_header(&header)?;

        let mut payload = vec![0u8; payload_len];
        read_full(reader, &mut payload, FRAME_HEADER_SIZE).await?;

        Ok(Self {
            frame_type,
            stream_id,
            payload: Bytes::from(payload),
        })
    }

    /// Write the frame as a single unit and flush it.
    ///
    /// Not cancel-safe: dropping the future mid-write leaves a partial frame
    /// on `writer`.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let buf = self.encode();
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

fn parse_header(header: &[u8]) -> Result<(FrameType, u32, usize), TunnelError> {
    let frame_type = FrameType::try_from(header[0])?;
    let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let payload_len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
    }

    Ok((frame_type, stream_id, payload_len))
}

/// Fill `buf` completely; `offset` is how many frame bytes precede it
async fn read_full<R>(reader: &mut R, buf: &mut [u8], offset: usize) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(TunnelError::TruncatedFrame {
                expected: offset + buf.len(),
                received: offset + filled,
            });
        }
        filled += n;
    }
    Ok(())
}
