//! Ed25519 entity identities.
//!
//! Every VEIL entity (relay or client) is addressed by its Ed25519 public key.
//! The same key pair signs stream requests, stream responses, discovery
//! entries and the session handshake transcript.
//!
//! ## Usage
//!
//! ```
//! use veil_crypto::generate_keypair;
//!
//! let (pk, sk) = generate_keypair();
//! let sig = sk.sign(b"authenticate this message");
//! assert!(pk.verify(b"authenticate this message", &sig).is_ok());
//! ```

use crate::CryptoError;
use ed25519_dalek::{Signer, Verifier};
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use zeroize::ZeroizeOnDrop;

/// Generate a fresh random key pair.
#[must_use]
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    let sk = SecretKey {
        inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
    };
    (sk.public_key(), sk)
}

/// Ed25519 public key (32 bytes), the address of an entity.
///
/// Stored as raw bytes so it can key maps cheaply; point validation happens
/// on [`PublicKey::verify`] and [`PublicKey::validate`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Create from raw bytes (not validated)
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero key
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Check that the bytes encode a valid Ed25519 point
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] otherwise.
    pub fn validate(&self) -> Result<(), CryptoError> {
        self.to_dalek().map(|_| ())
    }

    /// Verify a signature on a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// authenticate the message, or [`CryptoError::InvalidPublicKey`] if the
    /// key itself is malformed.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.to_dalek()?
            .verify(message, &ed25519_dalek::Signature::from_bytes(&signature.0))
            .map_err(|_| CryptoError::InvalidSignature)
    }

    fn to_dalek(self) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

/// Ed25519 secret key.
///
/// Zeroized on drop to prevent key material from lingering in memory.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecretKey {
    inner: ed25519_dalek::SigningKey,
}

impl SecretKey {
    /// Create from raw 32-byte seed
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Parse a hex-encoded 32-byte seed
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHex`] or [`CryptoError::InvalidKeyLength`].
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self::from_bytes(&seed))
    }

    /// The public key belonging to this secret key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.verifying_key().to_bytes())
    }

    /// Check that this secret key derives `pk`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyMismatch`] if it does not.
    pub fn check_pair(&self, pk: &PublicKey) -> Result<(), CryptoError> {
        if self.public_key() == *pk {
            Ok(())
        } else {
            Err(CryptoError::KeyMismatch)
        }
    }

    /// Sign a message (deterministic)
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }

    /// Export the seed bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; 64])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(serde::de::Error::custom)?
        } else {
            Vec::<u8>::deserialize(deserializer)?
        };
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let (pk, sk) = generate_keypair();
        let sig = sk.sign(b"hello relay");
        assert!(pk.verify(b"hello relay", &sig).is_ok());
    }

    #[test]
    fn test_wrong_message_fails_verification() {
        let (pk, sk) = generate_keypair();
        let sig = sk.sign(b"original");
        assert_eq!(
            pk.verify(b"tampered", &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let (_, sk1) = generate_keypair();
        let (pk2, _) = generate_keypair();
        let sig = sk1.sign(b"test");
        assert!(pk2.verify(b"test", &sig).is_err());
    }

    #[test]
    fn test_check_pair() {
        let (pk, sk) = generate_keypair();
        let (other, _) = generate_keypair();
        assert!(sk.check_pair(&pk).is_ok());
        assert_eq!(sk.check_pair(&other), Err(CryptoError::KeyMismatch));
    }

    #[test]
    fn test_secret_key_from_bytes_is_deterministic() {
        let (_, sk) = generate_keypair();
        let restored = SecretKey::from_bytes(&sk.to_bytes());
        assert_eq!(restored.public_key(), sk.public_key());
    }

    #[test]
    fn test_public_key_hex_parse() {
        let (pk, _) = generate_keypair();
        let parsed: PublicKey = pk.to_string().parse().unwrap();
        assert_eq!(parsed, pk);

        assert!(matches!(
            "abcd".parse::<PublicKey>(),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 2 })
        ));
        assert!(matches!(
            "zz".parse::<PublicKey>(),
            Err(CryptoError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_secret_key_from_hex() {
        let (_, sk) = generate_keypair();
        let restored = SecretKey::from_hex(&hex::encode(sk.to_bytes())).unwrap();
        assert_eq!(restored.public_key(), sk.public_key());
    }

    #[test]
    fn test_public_key_serde_binary() {
        let (pk, _) = generate_keypair();
        let bytes = bincode::serialize(&pk).unwrap();
        assert_eq!(bytes.len(), 32);
        let decoded: PublicKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, pk);
    }

    #[test]
    fn test_signature_from_slice_length() {
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
        assert!(Signature::from_slice(&[0u8; 64]).is_ok());
    }

    #[test]
    fn test_null_key() {
        assert!(PublicKey::default().is_null());
        let (pk, _) = generate_keypair();
        assert!(!pk.is_null());
        assert!(pk.validate().is_ok());
    }

    proptest::proptest! {
        #[test]
        fn prop_single_bit_flip_breaks_signature(
            msg in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..128),
            bit in 0usize..1024,
        ) {
            let (pk, sk) = generate_keypair();
            let sig = sk.sign(&msg);
            let mut tampered = msg.clone();
            let bit = bit % (tampered.len() * 8);
            tampered[bit / 8] ^= 1 << (bit % 8);
            proptest::prop_assert!(pk.verify(&msg, &sig).is_ok());
            proptest::prop_assert!(pk.verify(&tampered, &sig).is_err());
        }
    }
}
