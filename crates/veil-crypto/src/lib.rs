//! # VEIL Crypto
//!
//! Cryptographic primitives for the VEIL relay protocol.
//!
//! This crate provides:
//! - Ed25519 entity identities (public key addressing, request signing)
//! - X25519 ephemeral key exchange for session handshakes
//! - `ChaCha20-Poly1305` record encryption with counter nonces
//! - BLAKE3 hashing and key derivation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Identity / Signatures | Ed25519 | 128-bit |
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | ChaCha20-Poly1305 | 256-bit key |
//! | Hash / KDF | BLAKE3 | 128-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod keys;
pub mod x25519;

pub use aead::SessionCipher;
pub use error::CryptoError;
pub use hash::Hash;
pub use keys::{PublicKey, SecretKey, Signature, generate_keypair};

/// Ed25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// BLAKE3 output size
pub const HASH_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 authentication tag size
pub const AEAD_TAG_SIZE: usize = 16;
