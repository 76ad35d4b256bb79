//! Noise Protocol handshake implementation
//!
//! Uses the NNpsk0 pattern:
//! - Both sides hold the same pre-shared key; a wrong key fails the first message
//! - No static keys to distribute
//! - Forward secrecy via ephemeral keys

use super::{CryptoError, SharedKey, NOISE_PATTERN};
use snow::{params::NoiseParams, Builder, HandshakeState, TransportState};

/// Role in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Initiator (dialer)
    Initiator,
    /// Responder (listener)
    Responder,
}

/// Noise Protocol handshake state machine
pub struct NoiseHandshake {
    state: HandshakeState,
    role: HandshakeRole,
}

fn noise_params() -> Result<NoiseParams, CryptoError> {
    NOISE_PATTERN
        .parse()
        .map_err(|e: snow::Error| CryptoError::Handshake(e.to_string()))
}

impl NoiseHandshake {
    /// Create a new handshake for `role` keyed by `key`
    pub fn new(role: HandshakeRole, key: &SharedKey) -> Result<Self, CryptoError> {
        let builder = Builder::new(noise_params()?).psk(0, key.as_bytes());

        let state = match role {
            HandshakeRole::Initiator => builder.build_initiator(),
            HandshakeRole::Responder => builder.build_responder(),
        }
        .map_err(CryptoError::Noise)?;

        Ok(Self { state, role })
    }

    /// Create a new initiator (dialer) handshake
    pub fn new_initiator(key: &SharedKey) -> Result<Self, CryptoError> {
        Self::new(HandshakeRole::Initiator, key)
    }

    /// Create a new responder (listener) handshake
    pub fn new_responder(key: &SharedKey) -> Result<Self, CryptoError> {
        Self::new(HandshakeRole::Responder, key)
    }

    /// Get the handshake role
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Check if handshake is complete
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Write the next handshake message into `output`, returning its length
    pub fn write_message(
        &mut self,
        payload: &[u8],
        output: &mut [u8],
    ) -> Result<usize, CryptoError> {
        self.state
            .write_message(payload, output)
            .map_err(CryptoError::Noise)
    }

    /// Read an incoming handshake message, returning the payload length
    pub fn read_message(
        &mut self,
        message: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError> {
        self.state
            .read_message(message, payload)
            .map_err(CryptoError::Noise)
    }

    /// Convert to transport mode after handshake completion
    pub fn into_transport(self) -> Result<NoiseTransport, CryptoError> {
        if !self.is_finished() {
            return Err(CryptoError::Handshake(
                "Handshake not complete".to_string(),
            ));
        }

        let transport = self
            .state
            .into_transport_mode()
            .map_err(CryptoError::Noise)?;

        Ok(NoiseTransport { state: transport })
    }
}

/// Transport state for encrypted communication after handshake
pub struct NoiseTransport {
    state: TransportState,
}

impl NoiseTransport {
    /// Encrypt a message; `output` needs `plaintext.len() + TAG_LEN` bytes
    pub fn encrypt(&mut self, plaintext: &[u8], output: &mut [u8]) -> Result<usize, CryptoError> {
        self.state
            .write_message(plaintext, output)
            .map_err(CryptoError::Noise)
    }

    /// Decrypt and authenticate a message
    pub fn decrypt(&mut self, ciphertext: &[u8], output: &mut [u8]) -> Result<usize, CryptoError> {
        self.state
            .read_message(ciphertext, output)
            .map_err(CryptoError::Noise)
    }
}
