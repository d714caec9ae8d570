//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid hex encoding of a key or signature
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),

    /// Nonce overflow (counter exhausted)
    #[error("nonce counter exhausted")]
    NonceOverflow,

    /// Key exchange produced a low-order shared secret
    #[error("key exchange failed: low-order point")]
    LowOrderPoint,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Secret key does not correspond to the declared public key
    #[error("secret key does not match public key")]
    KeyMismatch,
}
