//! Local listeners that feed connections into the tunnel

use super::bridge::bridge;
use crate::config::ExposeConfig;
use crate::transport::{accept_with_backoff, TcpTransport, Transport, TransportListener};
use crate::tunnel::Multiplexer;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Holder of the current live tunnel session.
///
/// Exposed listeners outlive individual sessions; they look the session up
/// here for every connection they accept.
#[derive(Clone)]
pub struct SessionSlot {
    current: Arc<watch::Sender<Option<Multiplexer>>>,
}

impl SessionSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            current: Arc::new(tx),
        }
    }

    /// Make `mux` the current session
    pub fn set(&self, mux: Multiplexer) {
        self.current.send_replace(Some(mux));
    }

    /// The current session, if it is still alive
    pub fn current(&self) -> Option<Multiplexer> {
        self.current
            .borrow()
            .as_ref()
            .filter(|mux| !mux.is_closed())
            .cloned()
    }

    /// Wait until a live session is available
    pub async fn wait(&self) -> Multiplexer {
        let mut rx = self.current.subscribe();
        loop {
            if let Some(mux) = self.current() {
                return mux;
            }
            // The sender lives in `self`, so this only fails if it is dropped mid-call
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound local listener whose connections become tunnel streams
pub struct ExposedListener {
    listener: Box<dyn TransportListener>,
    service: String,
}

impl ExposedListener {
    /// Bind the local address named in `config`
    pub async fn bind(config: &ExposeConfig) -> Result<Self> {
        let listener = TcpTransport::new_default().listen(&config.bind).await?;
        info!(
            "Exposing {} through the tunnel (service {:?})",
            listener.local_addr()?,
            config.service
        );
        Ok(Self {
            listener,
            service: config.service.clone(),
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Service name requested from the peer
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Accept connections forever, opening one stream per connection on the
    /// session currently in `sessions`
    pub async fn run(mut self, sessions: SessionSlot) {
        loop {
            let (socket, peer_addr) = accept_with_backoff(&mut *self.listener).await;

            let Some(mux) = sessions.current() else {
                warn!("No live tunnel session, refusing connection from {}", peer_addr);
                continue;
            };

            let service = self.service.clone();
            tokio::spawn(async move {
                match mux.open_service(&service).await {
                    Ok(stream) => {
                        debug!("Local connection {} mapped to stream {}", peer_addr, stream.id());
                        bridge(stream, socket).await;
                    }
                    Err(e) => warn!("Failed to open stream for {}: {}", peer_addr, e),
                }
            });
        }
    }
}

/// Background tasks aborted together when dropped
pub(crate) struct TaskSet(Vec<JoinHandle<()>>);

impl TaskSet {
    /// Start one task per exposed listener
    pub(crate) fn spawn_exposed(listeners: Vec<ExposedListener>, sessions: &SessionSlot) -> Self {
        Self(
            listeners
                .into_iter()
                .map(|listener| tokio::spawn(listener.run(sessions.clone())))
                .collect(),
        )
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Bind every exposed listener in `configs`
pub(crate) async fn bind_all(configs: &[ExposeConfig]) -> Result<Vec<ExposedListener>> {
    let mut listeners = Vec::with_capacity(configs.len());
    for config in configs {
        listeners.push(ExposedListener::bind(config).await?);
    }
    Ok(listeners)
}
