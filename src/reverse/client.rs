//! Dialer ("iran") role

use super::expose::{bind_all, ExposedListener, SessionSlot, TaskSet};
use super::forward::{serve_session, Forwarder};
use crate::config::DialerConfig;
use crate::crypto::{wrap, HandshakeRole, SharedKey};
use crate::transport::{Transport, TransportConfig, TransportError};
use crate::tunnel::{Multiplexer, Role, Shutdown};
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Dials the listener and serves the resulting session
pub struct TunnelClient {
    transport: Arc<dyn Transport>,
    connect: String,
    key: SharedKey,
    handshake_timeout: Duration,
    retry_delay: Option<Duration>,
    forwarder: Arc<Forwarder>,
    exposed: Vec<ExposedListener>,
    sessions: SessionSlot,
}

impl TunnelClient {
    /// Prepare a client and bind its exposed listeners
    pub async fn new(config: &DialerConfig) -> Result<Self> {
        Ok(Self {
            transport: config.transport.build(TransportConfig::default()),
            connect: config.connect.clone(),
            key: config.shared_key()?,
            handshake_timeout: config.handshake_timeout(),
            retry_delay: config.retry_delay(),
            forwarder: Arc::new(Forwarder::from_config(&config.forwarding)),
            exposed: bind_all(&config.forwarding.expose).await?,
            sessions: SessionSlot::new(),
        })
    }

    /// Addresses of the exposed listeners, in configuration order
    pub fn exposed_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.exposed.iter().map(ExposedListener::local_addr).collect()
    }

    /// Slot holding the live session
    pub fn sessions(&self) -> SessionSlot {
        self.sessions.clone()
    }

    /// Dial, run the handshake as initiator, and start a multiplexer
    pub async fn connect(&self) -> Result<Multiplexer> {
        let conn = self.transport.dial(&self.connect).await?;
        let secure = tokio::time::timeout(
            self.handshake_timeout,
            wrap(conn, HandshakeRole::Initiator, &self.key),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        info!("Tunnel session established with {}", self.connect);
        Ok(Multiplexer::new(secure, Role::Dialer))
    }

    /// Connect and serve sessions.
    ///
    /// Without a retry delay the first failure is returned and a session
    /// that ends makes `run` return; with one, both lead to a reconnect.
    pub async fn run(mut self) -> Result<()> {
        let _exposed = TaskSet::spawn_exposed(std::mem::take(&mut self.exposed), &self.sessions);

        loop {
            match self.connect().await {
                Ok(mux) => {
                    self.sessions.set(mux.clone());
                    match serve_session(mux, Arc::clone(&self.forwarder)).await {
                        Shutdown::PeerClosed => info!("Tunnel session closed by peer"),
                        Shutdown::Failed(e) => warn!("Tunnel session failed: {}", e),
                    }
                    if self.retry_delay.is_none() {
                        return Ok(());
                    }
                }
                Err(e) => match self.retry_delay {
                    Some(_) => warn!("Failed to connect to {}: {}", self.connect, e),
                    None => return Err(e),
                },
            }

            if let Some(delay) = self.retry_delay {
                info!("Reconnecting in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
