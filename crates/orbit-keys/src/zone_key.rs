//! Zone keys.

use orbit_core::ZoneId;
use orbit_crypto::SymmetricKey;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one zone key version.
///
/// A rotation mints a new id; records reference the id of the key that
/// wraps them via `parent_key_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneKeyId(pub Uuid);

impl ZoneKeyId {
    /// Mint a fresh key id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The inner UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ZoneKeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ZoneKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zonekey-{}", self.0)
    }
}

/// The symmetric key encrypting all records in a zone.
///
/// Owned exclusively by the zone; travels only inside sealed
/// [`KeyShare`](crate::KeyShare)s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneKey {
    /// The zone this key belongs to.
    pub zone: ZoneId,
    /// This key version's identity.
    pub key_id: ZoneKeyId,
    /// Raw symmetric material. Never serialized to the record store.
    pub material: SymmetricKey,
    /// Rotation counter, starting at 1.
    pub version: u32,
}

impl ZoneKey {
    /// Generate a fresh zone key.
    pub fn generate<R: RngCore + CryptoRng>(zone: ZoneId, version: u32, rng: &mut R) -> Self {
        Self {
            zone,
            key_id: ZoneKeyId::new(),
            material: SymmetricKey::generate(rng),
            version,
        }
    }

    /// Generate the successor key for a rotation.
    pub fn rotated<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Self {
        Self::generate(self.zone.clone(), self.version + 1, rng)
    }
}
