//! Content hashing behind a single chokepoint.
//!
//! All digests in Orbit (manifest digests, peer fingerprints, record
//! hashes) go through [`hash`] or [`hasher`] so the algorithm is selected
//! in exactly one place. Current algorithm: SHA-256.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte content digest.
///
/// Ordered and hashable so digests can key `BTreeMap`s, which is what keeps
/// manifest construction deterministic across peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// The all-zero digest, used as a placeholder for "nothing hashed yet".
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.short())
    }
}

impl AsRef<[u8]> for Hash32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hash arbitrary bytes to a 32-byte digest.
pub fn hash(data: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update(data);
    Hash32(h.finalize().into())
}

/// Incremental hasher for multi-part input.
pub fn hasher() -> IncrementalHasher {
    IncrementalHasher(Sha256::new())
}

/// Incremental hashing state returned by [`hasher`].
pub struct IncrementalHasher(Sha256);

impl IncrementalHasher {
    /// Feed more bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> Hash32 {
        Hash32(self.0.finalize().into())
    }
}
