//! Reverse tunnel orchestration
//!
//! Ties the transport, secure channel and multiplexer together:
//! - [`TunnelServer`] accepts dialers and serves their streams
//! - [`TunnelClient`] dials out and serves the listener's streams
//! - exposed local listeners on either side open streams to the peer

mod bridge;
mod client;
mod expose;
mod forward;
mod server;

pub use bridge::{bridge, COPY_BUFFER_SIZE};
pub use client::TunnelClient;
pub use expose::{ExposedListener, SessionSlot};
pub use forward::{forward_stream, serve_session, Forwarder};
pub use server::TunnelServer;
