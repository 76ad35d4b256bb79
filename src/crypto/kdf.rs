//! Passphrase stretching
//!
//! Operators may configure a memorable passphrase instead of a random key;
//! HKDF-SHA256 turns it into the 32-byte pre-shared key.

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{KeyType, Salt, HKDF_SHA256};

/// Salt for passphrase stretching; changing it changes every derived key
const PASSPHRASE_SALT: &[u8] = b"ipmartnet passphrase salt v1";

/// Info label for the tunnel pre-shared key
const PSK_INFO: &[u8] = b"ipmartnet tunnel psk";

/// Output length marker for ring's HKDF
struct PskLen;

impl KeyType for PskLen {
    fn len(&self) -> usize {
        KEY_LEN
    }
}

/// Stretch a passphrase into a tunnel pre-shared key
pub fn derive_key_from_passphrase(passphrase: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::InvalidKey("empty passphrase".to_string()));
    }

    let info = [PSK_INFO];
    let prk = Salt::new(HKDF_SHA256, PASSPHRASE_SALT).extract(passphrase.as_bytes());
    let okm = prk
        .expand(&info, PskLen)
        .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;

    let mut key = [0u8; KEY_LEN];
    okm.fill(&mut key)
        .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_derivation() {
        let a = derive_key_from_passphrase("correct horse").unwrap();
        let b = derive_key_from_passphrase("correct horse").unwrap();
        let c = derive_key_from_passphrase("battery staple").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, [0u8; KEY_LEN]);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(
            derive_key_from_passphrase(""),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
