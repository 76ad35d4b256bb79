//! Raw TCP transport

use super::{BoxedConnection, Transport, TransportConfig, TransportError, TransportListener};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Raw TCP transport
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<BoxedConnection, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }

        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        debug!("TCP transport listening on {}", listener.local_addr()?);

        Ok(Box::new(TcpTransportListener {
            listener,
            nodelay: self.config.nodelay,
        }))
    }
}

/// Accepting side of [`TcpTransport`]
pub struct TcpTransportListener {
    listener: TcpListener,
    nodelay: bool,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&mut self) -> Result<(BoxedConnection, String), TransportError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true).ok();
        }
        Ok((Box::new(stream), peer_addr.to_string()))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_transport() {
        let transport = TcpTransport::new_default();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Simple echo server
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut conn = transport.dial(&addr.to_string()).await.unwrap();

        let msg = b"Hello, TCP!";
        conn.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], msg);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let transport = TcpTransport::new_default();
        assert!(matches!(
            transport.dial(&addr.to_string()).await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }
}
