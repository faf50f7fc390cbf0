//! AEAD-at-rest encryption for private key columns.
//!
//! On write, private keys are encrypted if an encryption key is
//! configured; on read, ciphertext is detected by a fixed 4-byte magic
//! prefix and decrypted transparently. Values written before encryption
//! was configured (or while it is unconfigured) are plain base64 and are
//! returned unchanged — the magic prefix is how a read distinguishes the
//! two without an extra schema column.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::StoreError;

/// 4-byte magic prefix marking a value as AEAD ciphertext.
const MAGIC: &[u8; 4] = b"WGP1";
const NONCE_LEN: usize = 12;

/// Wraps an `Aes256Gcm` cipher derived from the configured encryption
/// key. `None` at the call site means "encryption is not configured" —
/// callers pass `Option<&AeadCipher>` through every read/write path.
pub struct AeadCipher {
    cipher: Aes256Gcm,
}

impl AeadCipher {
    /// Build a cipher from a 32-byte key, typically derived from the
    /// session-signing secret via a KDF owned by the caller (out of
    /// scope here — this type takes the derived key directly).
    #[must_use]
    pub fn new(key_bytes: [u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt `plaintext`, returning a base64 string prefixed with the
    /// magic marker followed by the nonce and ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| StoreError::Decryption(format!("encrypt failed: {e}")))?;

        let mut buf = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(nonce.as_slice());
        buf.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(buf))
    }

    /// Decrypt a value previously produced by [`Self::encrypt`].
    pub fn decrypt(&self, stored: &str) -> Result<String, StoreError> {
        let raw = BASE64
            .decode(stored)
            .map_err(|e| StoreError::Decryption(format!("invalid base64 envelope: {e}")))?;
        if raw.len() < MAGIC.len() + NONCE_LEN {
            return Err(StoreError::Decryption("envelope too short".to_string()));
        }
        let nonce = Nonce::from_slice(&raw[MAGIC.len()..MAGIC.len() + NONCE_LEN]);
        let ciphertext = &raw[MAGIC.len() + NONCE_LEN..];
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| StoreError::Decryption(format!("decrypt failed: {e}")))?;
        String::from_utf8(plaintext).map_err(|e| StoreError::Decryption(e.to_string()))
    }
}

/// True when `stored` carries the AEAD magic prefix, i.e. it must be
/// decrypted rather than returned as plain base64.
#[must_use]
pub fn is_encrypted(stored: &str) -> bool {
    BASE64
        .decode(stored)
        .is_ok_and(|raw| raw.len() >= MAGIC.len() && raw.starts_with(MAGIC))
}

/// Encode `plaintext` for storage: encrypted if `cipher` is configured,
/// unchanged otherwise.
pub fn encode_for_storage(cipher: Option<&AeadCipher>, plaintext: &str) -> Result<String, StoreError> {
    match cipher {
        Some(c) => c.encrypt(plaintext),
        None => Ok(plaintext.to_string()),
    }
}

/// Decode a stored value: decrypt if it carries the magic prefix (and a
/// cipher is available), otherwise return it unchanged as legacy
/// plaintext.
pub fn decode_from_storage(cipher: Option<&AeadCipher>, stored: &str) -> Result<String, StoreError> {
    if !is_encrypted(stored) {
        return Ok(stored.to_string());
    }
    match cipher {
        Some(c) => c.decrypt(stored),
        None => Err(StoreError::Decryption(
            "value is encrypted but no encryption key is configured".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AeadCipher {
        AeadCipher::new([7u8; 32])
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let c = cipher();
        let ciphertext = c.encrypt("super-secret-key-material").expect("encrypt");
        assert!(is_encrypted(&ciphertext));
        let plaintext = c.decrypt(&ciphertext).expect("decrypt");
        assert_eq!(plaintext, "super-secret-key-material");
    }

    #[test]
    fn plain_legacy_value_is_not_detected_as_encrypted() {
        let plain = BASE64.encode([1u8; 32]);
        assert!(!is_encrypted(&plain));
    }

    #[test]
    fn encode_decode_without_cipher_is_passthrough() {
        let stored = encode_for_storage(None, "plain-base64-key").expect("encode");
        assert_eq!(stored, "plain-base64-key");
        let back = decode_from_storage(None, &stored).expect("decode");
        assert_eq!(back, "plain-base64-key");
    }

    #[test]
    fn encode_decode_with_cipher_round_trips() {
        let c = cipher();
        let stored = encode_for_storage(Some(&c), "plain-base64-key").expect("encode");
        assert_ne!(stored, "plain-base64-key");
        let back = decode_from_storage(Some(&c), &stored).expect("decode");
        assert_eq!(back, "plain-base64-key");
    }

    #[test]
    fn decoding_legacy_plaintext_with_cipher_configured_is_unchanged() {
        let c = cipher();
        let legacy = BASE64.encode([2u8; 32]);
        let back = decode_from_storage(Some(&c), &legacy).expect("decode");
        assert_eq!(back, legacy);
    }

    #[test]
    fn decoding_encrypted_value_without_cipher_fails() {
        let c = cipher();
        let ciphertext = c.encrypt("secret").expect("encrypt");
        let err = decode_from_storage(None, &ciphertext).unwrap_err();
        assert!(matches!(err, StoreError::Decryption(_)));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let a = AeadCipher::new([1u8; 32]);
        let b = AeadCipher::new([2u8; 32]);
        let ciphertext = a.encrypt("secret").expect("encrypt");
        let err = b.decrypt(&ciphertext).unwrap_err();
        assert!(matches!(err, StoreError::Decryption(_)));
    }
}
