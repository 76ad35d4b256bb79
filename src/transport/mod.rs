//! Transport layer implementations
//!
//! A transport yields ordered, reliable byte connections. Datagram
//! transports must provide reliability themselves before reaching the
//! tunnel. Provided backends:
//! - TCP

mod tcp;

pub use tcp::{TcpTransport, TcpTransportListener};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unsupported transport: {0}")]
    Unsupported(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// An ordered, reliable byte connection
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport connection
pub type BoxedConnection = Box<dyn Connection>;

/// Trait for transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote endpoint
    async fn dial(&self, addr: &str) -> Result<BoxedConnection, TransportError>;

    /// Start accepting connections on `addr`
    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError>;
}

/// Accepting side of a transport
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Wait for the next inbound connection
    async fn accept(&mut self) -> Result<(BoxedConnection, String), TransportError>;

    /// Address actually bound
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Pause after a failed accept before trying again
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept the next connection, backing off after each failure.
///
/// Errors such as running out of file descriptors repeat immediately, so
/// retrying without a pause would spin.
pub async fn accept_with_backoff<L>(listener: &mut L) -> (BoxedConnection, String)
where
    L: TransportListener + ?Sized,
{
    loop {
        match listener.accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Transport selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
}

impl TransportKind {
    /// Build the selected transport
    pub fn build(self, config: TransportConfig) -> Arc<dyn Transport> {
        match self {
            TransportKind::Tcp => Arc::new(TcpTransport::new(config)),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(TransportError::Unsupported(other.to_string())),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
        }
    }
}
