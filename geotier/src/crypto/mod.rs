//! Payload encryption for policies with `encryption_enabled`.
//!
//! The engine talks to a [`Cipher`]; [`AesGcmCipher`] is the production
//! implementation and [`IdentityCipher`] is a pass-through placeholder for
//! tests and for deployments that terminate encryption elsewhere. The cipher
//! name is recorded in every stored entry so a reader never applies the wrong
//! transform.

use crate::core::error::{CacheError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

const NONCE_LEN: usize = 12;

/// Reversible byte transform used for encryption at rest
pub trait Cipher: Send + Sync {
    /// Identifier stored alongside encrypted entries
    fn name(&self) -> &'static str;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through cipher. Provides no confidentiality.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCipher;

impl Cipher for IdentityCipher {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// AES-256-GCM with a random 96-bit nonce prepended to each ciphertext
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Create a cipher from a 32-byte key
    pub fn with_key(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            CacheError::Configuration(format!(
                "encryption key must be 32 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { cipher })
    }

    /// Create a cipher from a hex-encoded 32-byte key
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let key = hex::decode(key_hex.trim())
            .map_err(|e| CacheError::Configuration(format!("invalid encryption key: {}", e)))?;
        Self::with_key(&key)
    }

    /// Create a cipher with a freshly generated key
    pub fn random() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }
}

impl Cipher for AesGcmCipher {
    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let encrypted = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CacheError::Transform(format!("AES-GCM encryption failed: {:?}", e)))?;

        let mut result = Vec::with_capacity(NONCE_LEN + encrypted.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&encrypted);
        Ok(result)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CacheError::Transform(
                "Invalid encrypted data length".to_string(),
            ));
        }

        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| CacheError::Transform(format!("AES-GCM decryption failed: {:?}", e)))
    }
}

/// Encryption configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Hex-encoded 32-byte AES key. Falls back to `GEOTIER_ENCRYPTION_KEY`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_hex: Option<String>,
}

impl EncryptionConfig {
    /// Environment variable consulted when no key is configured
    pub const KEY_ENV: &'static str = "GEOTIER_ENCRYPTION_KEY";

    /// Build the cipher for this configuration.
    ///
    /// Without a key a random one is generated, so encrypted entries written by
    /// this process become unreadable after a restart.
    pub fn build_cipher(&self) -> Result<Arc<dyn Cipher>> {
        let key = self
            .key_hex
            .clone()
            .or_else(|| std::env::var(Self::KEY_ENV).ok());

        match key {
            Some(key_hex) => Ok(Arc::new(AesGcmCipher::from_hex(&key_hex)?)),
            None => {
                warn!(
                    "No encryption key configured ({} unset); using an ephemeral key",
                    Self::KEY_ENV
                );
                Ok(Arc::new(AesGcmCipher::random()))
            }
        }
    }
}
