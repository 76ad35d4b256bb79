//! Tunnel layer - multiplexed streams over one secure channel
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream multiplexing with parity-partitioned stream ids
//! - Per-stream lifecycle (open, data, close)

mod frame;
mod multiplexer;
mod stream;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use multiplexer::{Multiplexer, Role, Shutdown};
pub use stream::{Stream, StreamReader, StreamWriter};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Truncated frame: expected {expected} bytes, got {received}")]
    TruncatedFrame { expected: usize, received: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Unknown stream: {0}")]
    UnknownStream(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Stream ids exhausted")]
    IdsExhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capacity of each stream's inbound queue, in chunks
pub const INBOUND_QUEUE_CAPACITY: usize = 32;

/// Capacity of the queue of encoded frames awaiting the writer task
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Capacity of the queue of peer-opened streams awaiting `accept()`
pub const ACCEPT_BACKLOG: usize = 64;
