//! At-rest protection for the stored API key.
//!
//! The key file holds a base64 encoded 256-bit key. Sealed values are base64
//! of `nonce || ciphertext` under ChaCha20-Poly1305.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Nonce};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (was the secret key replaced?)")]
    DecryptionFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("IO error: {0}")]
    Io(String),
}

/// Symmetric key used to seal the API key inside `settings.json`.
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Load the key file, creating it (mode 0600 on Unix) when absent.
    pub fn load_or_create(path: &Path) -> Result<Self, SecretError> {
        if path.exists() {
            let encoded =
                std::fs::read_to_string(path).map_err(|e| SecretError::Io(e.to_string()))?;
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|_| SecretError::InvalidEncoding)?;
            let bytes: [u8; KEY_LEN] = bytes
                .try_into()
                .map_err(|_| SecretError::InvalidKeyLength)?;
            return Ok(Self(bytes));
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SecretError::Io(e.to_string()))?;
        }
        std::fs::write(path, STANDARD.encode(key.0)).map_err(|e| SecretError::Io(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SecretError::Io(e.to_string()))?;
        }

        Ok(key)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.0).into())
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn open(&self, sealed: &str) -> Result<String, SecretError> {
        let combined = STANDARD
            .decode(sealed.trim())
            .map_err(|_| SecretError::InvalidEncoding)?;
        if combined.len() < NONCE_LEN {
            return Err(SecretError::InvalidEncoding);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::InvalidUtf8)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}
