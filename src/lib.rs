//! # ipmartnet
//!
//! A reverse tunnel: a host that can only dial out keeps one encrypted
//! connection to a public host, and local services on both ends are
//! reached through streams multiplexed over it.
//!
//! ## Features
//!
//! - **Pre-shared key encryption** using Noise Protocol (NNpsk0 pattern)
//! - **Stream multiplexing** with per-stream ordering over one connection
//! - **Both directions**: either side may open streams to the other
//! - **Named services** routed to different local destinations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Orchestration Layer                  │
//! │     (listener/dialer roles, forwarding, bridges)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │         (Open/Data/Close frames, stream table)       │
//! ├─────────────────────────────────────────────────────┤
//! │                   Secure Channel                     │
//! │         (Noise handshake, encrypted records)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                       (TCP)                          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod reverse;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to reach {destination}: {source}")]
    LocalDial {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown service: {0:?}")]
    UnknownService(String),
}
