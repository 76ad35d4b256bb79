//! Encrypted byte stream over a transport connection
//!
//! Wire format after the handshake:
//! ```text
//! +--------+--------+------------------------------+
//! | Length (2B, BE) | Noise ciphertext (Length B)  |
//! +--------+--------+------------------------------+
//! ```
//! Handshake messages use the same length prefix.

use super::{
    CryptoError, HandshakeRole, NoiseHandshake, NoiseTransport, SharedKey, MAX_NOISE_MESSAGE,
    TAG_LEN,
};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const LEN_PREFIX: usize = 2;

/// Largest plaintext carried by one record
pub const MAX_RECORD_PLAINTEXT: usize = MAX_NOISE_MESSAGE - TAG_LEN;

/// Perform the handshake over `io` and return the secured stream.
///
/// Fails closed: on any handshake error nothing usable is returned.
pub async fn wrap<S>(
    mut io: S,
    role: HandshakeRole,
    key: &SharedKey,
) -> Result<SecureStream<S>, CryptoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = NoiseHandshake::new(role, key)?;

    match role {
        HandshakeRole::Initiator => {
            // -> psk, e
            send_handshake_message(&mut io, &mut handshake).await?;
            // <- e, ee
            recv_handshake_message(&mut io, &mut handshake).await?;
        }
        HandshakeRole::Responder => {
            recv_handshake_message(&mut io, &mut handshake).await?;
            send_handshake_message(&mut io, &mut handshake).await?;
        }
    }

    let noise = handshake.into_transport()?;
    Ok(SecureStream::new(io, noise))
}

async fn send_handshake_message<S>(
    io: &mut S,
    handshake: &mut NoiseHandshake,
) -> Result<(), CryptoError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; LEN_PREFIX + MAX_NOISE_MESSAGE];
    let len = handshake.write_message(&[], &mut buf[LEN_PREFIX..])?;
    buf[..LEN_PREFIX].copy_from_slice(&(len as u16).to_be_bytes());

    io.write_all(&buf[..LEN_PREFIX + len]).await?;
    io.flush().await?;
    Ok(())
}

async fn recv_handshake_message<S>(
    io: &mut S,
    handshake: &mut NoiseHandshake,
) -> Result<(), CryptoError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    io.read_exact(&mut len_buf)
        .await
        .map_err(|e| CryptoError::Handshake(format!("peer hung up: {}", e)))?;
    let msg_len = u16::from_be_bytes(len_buf) as usize;

    let mut msg = vec![0u8; msg_len];
    io.read_exact(&mut msg)
        .await
        .map_err(|e| CryptoError::Handshake(format!("truncated handshake message: {}", e)))?;

    let mut payload = vec![0u8; MAX_NOISE_MESSAGE];
    handshake
        .read_message(&msg, &mut payload)
        .map_err(|e| CryptoError::Handshake(format!("peer rejected: {}", e)))?;
    Ok(())
}

/// Encrypted, authenticated byte stream.
///
/// Writes are sealed into records of at most [`MAX_RECORD_PLAINTEXT`] bytes;
/// a sealed record is only guaranteed to reach the transport after `flush`.
pub struct SecureStream<S> {
    inner: S,
    noise: NoiseTransport,
    /// Record being received (length prefix + ciphertext)
    rx_record: Vec<u8>,
    rx_filled: usize,
    /// Decrypted bytes not yet handed to the reader
    rx_plain: BytesMut,
    /// Sealed record waiting to be written
    tx_record: Vec<u8>,
    tx_written: usize,
}

impl<S> SecureStream<S> {
    fn new(inner: S, noise: NoiseTransport) -> Self {
        Self {
            inner,
            noise,
            rx_record: vec![0u8; LEN_PREFIX],
            rx_filled: 0,
            rx_plain: BytesMut::new(),
            tx_record: Vec::new(),
            tx_written: 0,
        }
    }

    /// Get a reference to the underlying connection
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn seal(&mut self, plaintext: &[u8]) -> io::Result<()> {
        self.tx_record.clear();
        self.tx_record.resize(LEN_PREFIX + plaintext.len() + TAG_LEN, 0);
        self.tx_written = 0;

        let len = self
            .noise
            .encrypt(plaintext, &mut self.tx_record[LEN_PREFIX..])
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.tx_record.truncate(LEN_PREFIX + len);
        self.tx_record[..LEN_PREFIX].copy_from_slice(&(len as u16).to_be_bytes());
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> SecureStream<S> {
    /// Read and decrypt the next record into `rx_plain`.
    ///
    /// Resolves to `false` on a clean end of stream between records.
    fn poll_next_record(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        loop {
            let target = if self.rx_filled < LEN_PREFIX {
                LEN_PREFIX
            } else {
                let len = u16::from_be_bytes([self.rx_record[0], self.rx_record[1]]) as usize;
                if len < TAG_LEN {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("secure record too short: {} bytes", len),
                    )));
                }
                LEN_PREFIX + len
            };

            if self.rx_filled == target && target > LEN_PREFIX {
                let mut plain = vec![0u8; target - LEN_PREFIX];
                let len = self
                    .noise
                    .decrypt(&self.rx_record[LEN_PREFIX..target], &mut plain)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                self.rx_plain.extend_from_slice(&plain[..len]);
                self.rx_filled = 0;
                return Poll::Ready(Ok(true));
            }

            if self.rx_record.len() < target {
                self.rx_record.resize(target, 0);
            }

            let mut buf = ReadBuf::new(&mut self.rx_record[self.rx_filled..target]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
            let n = buf.filled().len();

            if n == 0 {
                if self.rx_filled == 0 {
                    return Poll::Ready(Ok(false));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "secure record truncated",
                )));
            }
            self.rx_filled += n;
        }
    }
}

impl<S: AsyncWrite + Unpin> SecureStream<S> {
    /// Write out any sealed record
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.tx_written < self.tx_record.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.tx_record[self.tx_written..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.tx_written += n;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SecureStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.rx_plain.is_empty() {
            if !ready!(this.poll_next_record(cx))? {
                return Poll::Ready(Ok(()));
            }
        }

        let n = this.rx_plain.len().min(buf.remaining());
        buf.put_slice(&this.rx_plain[..n]);
        this.rx_plain.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SecureStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.poll_drain(cx))?;

        let n = buf.len().min(MAX_RECORD_PLAINTEXT);
        this.seal(&buf[..n])?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
