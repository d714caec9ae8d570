//! Public-key addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use veil_crypto::PublicKey;

/// An entity key plus a port, one end of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    /// Entity public key
    pub pk: PublicKey,
    /// Port on that entity
    pub port: u16,
}

impl Addr {
    /// Create an address
    #[must_use]
    pub const fn new(pk: PublicKey, port: u16) -> Self {
        Self { pk, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let addr = Addr::new(PublicKey::from_bytes([0xAB; 32]), 80);
        assert!(addr.to_string().starts_with("abab"));
        assert!(addr.to_string().ends_with(":80"));
    }
}
