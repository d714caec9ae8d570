//! BLAKE3 hashing and key derivation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 hash output (32 bytes).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Hash `data`.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(&self.0[..8]))
    }
}

/// Incremental transcript hash over length-prefixed parts.
///
/// Length prefixes keep `("ab", "c")` and `("a", "bc")` distinct.
#[derive(Clone)]
pub struct Transcript {
    hasher: blake3::Hasher,
}

impl Transcript {
    /// Start a transcript bound to a protocol label.
    #[must_use]
    pub fn new(label: &[u8]) -> Self {
        let mut t = Self {
            hasher: blake3::Hasher::new(),
        };
        t.append(label);
        t
    }

    /// Append one part.
    pub fn append(&mut self, part: &[u8]) {
        self.hasher.update(&(part.len() as u64).to_be_bytes());
        self.hasher.update(part);
    }

    /// Current transcript hash.
    #[must_use]
    pub fn finalize(&self) -> Hash {
        Hash(*self.hasher.finalize().as_bytes())
    }
}

/// Derive `N` bytes of key material from `ikm` under a context string.
#[must_use]
pub fn derive_key_material<const N: usize>(context: &str, ikm: &[&[u8]]) -> [u8; N] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in ikm {
        hasher.update(part);
    }
    let mut out = [0u8; N];
    hasher.finalize_xof().fill(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(Hash::of(b"abc"), Hash::of(b"abc"));
        assert_ne!(Hash::of(b"abc"), Hash::of(b"abd"));
    }

    #[test]
    fn test_transcript_is_length_prefixed() {
        let mut a = Transcript::new(b"label");
        a.append(b"ab");
        a.append(b"c");

        let mut b = Transcript::new(b"label");
        b.append(b"a");
        b.append(b"bc");

        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_derive_key_material_context_separation() {
        let k1: [u8; 64] = derive_key_material("ctx one", &[b"secret"]);
        let k2: [u8; 64] = derive_key_material("ctx two", &[b"secret"]);
        assert_ne!(k1, k2);
        assert_ne!(k1[..32], k1[32..]);
    }
}
