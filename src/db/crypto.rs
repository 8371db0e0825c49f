//! Token encryption
//!
//! Upstream integration tokens and webhook secrets are stored as
//! AES-256-CTR ciphertext with a random 16-byte IV, serialized as
//! `iv_hex:cipher_hex`. The key is the configured 32-byte hex secret, or the
//! SHA-256 digest of a shorter secret. Encryption is symmetric and
//! reversible in-process only.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256Ctr = Ctr128BE<Aes256>;

/// IV length in bytes
const IV_LEN: usize = 16;

/// Cipher errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Payload is not `iv_hex:cipher_hex`
    #[error("Malformed ciphertext payload")]
    Format,

    /// Hex decoding failed
    #[error("Invalid hex in ciphertext: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Decrypted bytes are not valid UTF-8
    #[error("Decrypted payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// AES-256-CTR cipher for persisted secrets
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    /// Derive the key from the configured secret: 64 hex characters are
    /// used directly, anything else is SHA-256 hashed
    pub fn new(secret: &str) -> Self {
        let key = match hex::decode(secret) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                key
            }
            _ => Sha256::digest(secret.as_bytes()).into(),
        };
        Self { key }
    }

    /// Encrypt to `iv_hex:cipher_hex`
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut buffer = plaintext.as_bytes().to_vec();
        let mut cipher = Aes256Ctr::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(&mut buffer);

        format!("{}:{}", hex::encode(iv), hex::encode(buffer))
    }

    /// Decrypt from `iv_hex:cipher_hex`
    pub fn decrypt(&self, payload: &str) -> Result<String, CryptoError> {
        let (iv_hex, cipher_hex) = payload.split_once(':').ok_or(CryptoError::Format)?;
        let iv_bytes = hex::decode(iv_hex)?;
        if iv_bytes.len() != IV_LEN {
            return Err(CryptoError::Format);
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&iv_bytes);

        let mut buffer = hex::decode(cipher_hex)?;
        let mut cipher = Aes256Ctr::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(&mut buffer);

        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_roundtrip() {
        let cipher = TokenCipher::new("a configured application secret");
        let token = "secret_abc123";
        let encrypted = cipher.encrypt(token);
        assert_ne!(encrypted, token);
        assert!(encrypted.contains(':'));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), token);
    }

    #[test]
    fn test_each_encryption_uses_fresh_iv() {
        let cipher = TokenCipher::new("secret");
        let a = cipher.encrypt("same input");
        let b = cipher.encrypt("same input");
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn test_hex_key_used_directly() {
        let hex_key = "00".repeat(32);
        let a = TokenCipher::new(&hex_key);
        let b = TokenCipher::new(&hex_key);
        let payload = a.encrypt("data");
        assert_eq!(b.decrypt(&payload).unwrap(), "data");
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        let cipher = TokenCipher::new("secret");
        assert!(matches!(cipher.decrypt("no-separator"), Err(CryptoError::Format)));
        assert!(matches!(cipher.decrypt("abcd:zzzz"), Err(CryptoError::Hex(_))));
        assert!(matches!(cipher.decrypt("abcd:1234"), Err(CryptoError::Format)));
    }

    proptest! {
        #[test]
        fn prop_encrypt_decrypt_identity(token in ".*") {
            let cipher = TokenCipher::new("prop secret");
            let encrypted = cipher.encrypt(&token);
            prop_assert_eq!(cipher.decrypt(&encrypted).unwrap(), token);
        }
    }
}
