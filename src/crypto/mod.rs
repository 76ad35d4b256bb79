//! Secure channel for the tunnel
//!
//! This module provides:
//! - Noise Protocol handshake (NNpsk0 pattern) keyed by a pre-shared key
//! - An encrypted, authenticated byte stream over any transport connection
//! - HKDF-SHA256 stretching of passphrases into keys
//! - Secure random key generation

mod channel;
mod handshake;
mod kdf;
mod keys;

pub use channel::{wrap, SecureStream, MAX_RECORD_PLAINTEXT};
pub use handshake::{HandshakeRole, NoiseHandshake, NoiseTransport};
pub use kdf::derive_key_from_passphrase;
pub use keys::SharedKey;

use thiserror::Error;

/// Noise Protocol pattern used for handshake
/// NNpsk0: both sides prove knowledge of the pre-shared key in the first
/// round trip; ephemeral keys give forward secrecy
pub const NOISE_PATTERN: &str = "Noise_NNpsk0_25519_ChaChaPoly_SHA256";

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Largest Noise message (handshake or transport)
pub const MAX_NOISE_MESSAGE: usize = 65535;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| CryptoError::KeyGeneration("system RNG unavailable".to_string()))
}
