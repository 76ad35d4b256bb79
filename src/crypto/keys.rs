//! Pre-shared key handling

use super::{derive_key_from_passphrase, random_bytes, CryptoError, KEY_LEN};
use base64::Engine;
use std::fmt;

/// 32-byte pre-shared tunnel key (kept secret)
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_LEN]);

impl SharedKey {
    /// Generate a new random key
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        random_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Parse a configured key.
    ///
    /// A base64 string of exactly 32 bytes is used as-is; anything else is
    /// treated as a passphrase and stretched with HKDF.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let s = s.trim();
        if let Ok(key) = Self::from_base64(s) {
            return Ok(key);
        }
        derive_key_from_passphrase(s).map(Self)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as base64 (be careful with this!)
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey([REDACTED])")
    }
}

// Zeroize key on drop
impl Drop for SharedKey {
    fn drop(&mut self) {
        for byte in &mut self.0 {
            unsafe {
                std::ptr::write_volatile(byte, 0);
            }
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}
