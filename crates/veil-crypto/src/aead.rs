//! Record encryption for established sessions.
//!
//! Each direction of a session owns one [`SessionCipher`]. Nonces are the
//! record counter, so a dropped, replayed or reordered record fails
//! authentication on the receiving side.

use crate::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

/// One-direction ChaCha20-Poly1305 state with an implicit counter nonce.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SessionCipher {
    /// Create from a 32-byte traffic key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            counter: 0,
        }
    }

    /// Number of records processed so far.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    /// Encrypt one record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] when the counter is exhausted
    /// or [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt one record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if authentication fails.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
