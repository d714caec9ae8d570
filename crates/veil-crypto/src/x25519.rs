//! X25519 Diffie-Hellman key exchange (RFC 7748).
//!
//! Session handshakes use one fresh key pair per connection, so every
//! session gets forward-secret traffic keys.

use crate::CryptoError;
use rand_core::OsRng;
use zeroize::ZeroizeOnDrop;

/// Per-handshake X25519 secret.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralSecret(x25519_dalek::StaticSecret);

/// X25519 shared secret (32 bytes).
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl EphemeralSecret {
    /// Generate a new random secret.
    #[must_use]
    pub fn generate() -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(OsRng))
    }

    /// Public half, sent to the peer.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; 32] {
        x25519_dalek::PublicKey::from(&self.0).to_bytes()
    }

    /// Perform Diffie-Hellman with the peer's public half.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::LowOrderPoint`] if the peer sent a low-order
    /// point (the shared secret would be all zeros).
    pub fn exchange(&self, peer_public: &[u8; 32]) -> Result<SharedSecret, CryptoError> {
        let shared = self
            .0
            .diffie_hellman(&x25519_dalek::PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPoint);
        }
        Ok(SharedSecret(shared))
    }
}

impl SharedSecret {
    /// Shared secret bytes; feed through a KDF before use as a key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_agrees() {
        let alice = EphemeralSecret::generate();
        let bob = EphemeralSecret::generate();

        let ab = alice.exchange(&bob.public_bytes()).unwrap();
        let ba = bob.exchange(&alice.public_bytes()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = EphemeralSecret::generate();
        assert!(matches!(
            alice.exchange(&[0u8; 32]),
            Err(CryptoError::LowOrderPoint)
        ));
    }
}
