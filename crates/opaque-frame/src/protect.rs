//! Authenticated encryption of token payloads.
//!
//! The token codec only needs two operations, so the capability is a small
//! trait. [`AeadProtector`] is the default implementation:
//! XChaCha20-Poly1305 with a fresh random nonce per call and the configured
//! purpose string bound in as associated data, so a token sealed for one
//! purpose never opens under another.
//!
//! Wire form: `nonce (24 bytes) || ciphertext || tag (16 bytes)`.

use std::fmt;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use opaque_frame_common::ProtectionOptions;

use crate::error::{ProxyError, Result};

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Confidentiality and integrity for opaque byte strings.
pub trait Protector: Send + Sync {
    /// Seals `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protection`] if sealing fails.
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Opens bytes produced by [`protect`](Self::protect).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protection`] for any malformed, truncated or
    /// tampered input. The error never says which.
    fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>>;
}

/// XChaCha20-Poly1305 protector.
pub struct AeadProtector {
    cipher: XChaCha20Poly1305,
    purpose: Vec<u8>,
}

impl fmt::Debug for AeadProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadProtector")
            .field("purpose", &String::from_utf8_lossy(&self.purpose))
            .finish_non_exhaustive()
    }
}

impl AeadProtector {
    /// Creates a protector from a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protection`] if the key is not 32 bytes.
    pub fn new(key: &[u8], purpose: impl Into<String>) -> Result<Self> {
        let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| {
            ProxyError::Protection(format!("key must be 32 bytes (got {})", key.len()))
        })?;

        Ok(Self {
            cipher,
            purpose: purpose.into().into_bytes(),
        })
    }

    /// Creates a protector from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protection`] if the decoded key is not 32 bytes.
    pub fn from_options(options: &ProtectionOptions) -> Result<Self> {
        Self::new(&options.key_bytes(), options.purpose.clone())
    }
}

impl Protector for AeadProtector {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &self.purpose,
                },
            )
            .map_err(|_| ProxyError::Protection("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>> {
        if protected.len() < NONCE_LEN + TAG_LEN {
            return Err(ProxyError::Protection("malformed input".to_string()));
        }

        let (nonce, sealed) = protected.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &self.purpose,
                },
            )
            .map_err(|_| ProxyError::Protection("malformed input".to_string()))
    }
}
