//! The at-rest form of symmetric ciphertext.
//!
//! Private asset halves, symmetric edges and sealed boxes all store an
//! [`EncryptedPayload`]: a version byte, the nonce and the AEAD output.

use serde::{Deserialize, Serialize};

use crate::crypto::SymKey;
use crate::error::{PermsError, Result};

/// ChaCha20-Poly1305 with a key-and-plaintext derived nonce.
pub const ENVELOPE_V1: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub version: u8,
    pub nonce: [u8; 12],
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// The same key and plaintext always yield the same envelope.
    pub fn encrypt(plaintext: &[u8], key: &SymKey) -> Result<Self> {
        let nonce = key.nonce_for(plaintext);
        Ok(Self {
            version: ENVELOPE_V1,
            nonce,
            ciphertext: key.encrypt(&nonce, plaintext)?,
        })
    }

    pub fn decrypt(&self, key: &SymKey) -> Result<Vec<u8>> {
        if self.version != ENVELOPE_V1 {
            return Err(PermsError::DecryptionError(format!(
                "unsupported envelope version {}",
                self.version
            )));
        }
        key.decrypt(&self.nonce, &self.ciphertext)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| PermsError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| PermsError::SerializationError(e.to_string()))
    }
}
