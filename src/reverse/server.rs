//! Listener ("outside") role

use super::expose::{bind_all, ExposedListener, SessionSlot, TaskSet};
use super::forward::{serve_session, Forwarder};
use crate::config::ListenerConfig;
use crate::crypto::{wrap, HandshakeRole, SharedKey};
use crate::transport::{
    accept_with_backoff, BoxedConnection, TransportConfig, TransportError, TransportListener,
};
use crate::tunnel::{Multiplexer, Role, Shutdown};
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Server state shared across connections
struct ServerState {
    key: SharedKey,
    forwarder: Arc<Forwarder>,
    sessions: SessionSlot,
    handshake_timeout: Duration,
    /// Connection semaphore for limiting concurrent sessions
    conn_semaphore: Arc<Semaphore>,
}

/// Accepts tunnel connections from dialers and serves their streams
pub struct TunnelServer {
    listener: Box<dyn TransportListener>,
    exposed: Vec<ExposedListener>,
    state: Arc<ServerState>,
}

impl TunnelServer {
    /// Bind the tunnel listener and every exposed listener
    pub async fn bind(config: &ListenerConfig) -> Result<Self> {
        let key = config.shared_key()?;
        let transport = config.transport.build(TransportConfig::default());
        let listener = transport.listen(&config.listen).await?;
        let exposed = bind_all(&config.forwarding.expose).await?;

        info!(
            "Listening for tunnel connections on {} ({})",
            listener.local_addr()?,
            config.transport
        );

        Ok(Self {
            listener,
            exposed,
            state: Arc::new(ServerState {
                key,
                forwarder: Arc::new(Forwarder::from_config(&config.forwarding)),
                sessions: SessionSlot::new(),
                handshake_timeout: config.handshake_timeout(),
                conn_semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
            }),
        })
    }

    /// Address the tunnel listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Addresses of the exposed listeners, in configuration order
    pub fn exposed_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.exposed.iter().map(ExposedListener::local_addr).collect()
    }

    /// Slot holding the most recent live session
    pub fn sessions(&self) -> SessionSlot {
        self.state.sessions.clone()
    }

    /// Accept connections until the task is cancelled.
    ///
    /// Transport and handshake failures only affect the connection they
    /// happen on.
    pub async fn run(mut self) -> Result<()> {
        let _exposed = TaskSet::spawn_exposed(
            std::mem::take(&mut self.exposed),
            &self.state.sessions,
        );

        loop {
            let (conn, peer_addr) = accept_with_backoff(&mut *self.listener).await;
            debug!("New connection from {}", peer_addr);

            // Over the limit: refuse now rather than queue behind live sessions
            let Ok(permit) = Arc::clone(&self.state.conn_semaphore).try_acquire_owned() else {
                warn!("Connection limit reached, refusing {}", peer_addr);
                continue;
            };

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(conn, &peer_addr, state).await {
                    warn!("Connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Handle a single dialer connection
async fn handle_connection(
    conn: BoxedConnection,
    peer_addr: &str,
    state: Arc<ServerState>,
) -> Result<()> {
    let secure = tokio::time::timeout(
        state.handshake_timeout,
        wrap(conn, HandshakeRole::Responder, &state.key),
    )
    .await
    .map_err(|_| TransportError::Timeout)??;
    info!("Tunnel session established with {}", peer_addr);

    let mux = Multiplexer::new(secure, Role::Listener);
    state.sessions.set(mux.clone());

    match serve_session(mux, Arc::clone(&state.forwarder)).await {
        Shutdown::PeerClosed => info!("Tunnel session with {} closed", peer_addr),
        Shutdown::Failed(e) => warn!("Tunnel session with {} failed: {}", peer_addr, e),
    }
    Ok(())
}
