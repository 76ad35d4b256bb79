//! Routing of peer-opened streams to local destinations

use super::bridge::bridge;
use crate::config::ForwardingConfig;
use crate::tunnel::{Multiplexer, Shutdown, Stream};
use crate::{Error, Result};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Resolves service names to local addresses and dials them
#[derive(Debug, Clone)]
pub struct Forwarder {
    default_destination: Option<String>,
    services: HashMap<String, String>,
    connect_timeout: Duration,
}

impl Forwarder {
    /// Forward unnamed streams to `default_destination`
    pub fn new(default_destination: Option<String>) -> Self {
        Self {
            default_destination,
            services: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Build from a `[*.forwarding]` section
    pub fn from_config(config: &ForwardingConfig) -> Self {
        Self {
            default_destination: config.destination.clone(),
            services: config.services.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Add a named destination
    pub fn with_service(mut self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.services.insert(name.into(), destination.into());
        self
    }

    /// Set the local dial timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Address a stream for `service` should reach
    pub fn resolve(&self, service: &str) -> Result<&str> {
        let destination = if service.is_empty() {
            self.default_destination.as_deref()
        } else {
            self.services.get(service).map(String::as_str)
        };
        destination.ok_or_else(|| Error::UnknownService(service.to_string()))
    }

    /// Dial the destination for `service`
    pub async fn connect(&self, service: &str) -> Result<TcpStream> {
        let destination = self.resolve(service)?;

        let local = tokio::time::timeout(self.connect_timeout, TcpStream::connect(destination))
            .await
            .map_err(|_| Error::LocalDial {
                destination: destination.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| Error::LocalDial {
                destination: destination.to_string(),
                source,
            })?;

        let _ = local.set_nodelay(true);
        Ok(local)
    }
}

/// Connect a peer-opened stream to its local destination and relay it.
///
/// A failed dial closes the stream and leaves the channel untouched.
pub async fn forward_stream(stream: Stream, forwarder: &Forwarder) -> Result<()> {
    let stream_id = stream.id();
    let local = match forwarder.connect(stream.service()).await {
        Ok(local) => local,
        Err(e) => {
            if let Err(close_err) = stream.close().await {
                debug!("Stream {} close after failed dial: {}", stream_id, close_err);
            }
            return Err(e);
        }
    };

    match local.peer_addr() {
        Ok(addr) => info!("Stream {} connected to {}", stream_id, addr),
        Err(_) => info!("Stream {} connected", stream_id),
    }
    bridge(stream, local).await;
    Ok(())
}

/// Forward every stream the peer opens until the channel shuts down
pub async fn serve_session(mux: Multiplexer, forwarder: Arc<Forwarder>) -> Shutdown {
    while let Some(stream) = mux.accept().await {
        let forwarder = Arc::clone(&forwarder);
        tokio::spawn(async move {
            let stream_id = stream.id();
            if let Err(e) = forward_stream(stream, &forwarder).await {
                warn!("Stream {} forwarding failed: {}", stream_id, e);
            }
        });
    }
    mux.closed().await
}
