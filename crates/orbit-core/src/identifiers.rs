//! Identifier newtypes used across the Orbit engine.

use crate::hash::{hash, Hash32};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of one device participating in secret sync.
///
/// A peer id is the fingerprint of the device's public signing key, so two
/// identities with the same signing key compare equal regardless of any
/// other gestalt differences. Use
/// `PeerIdentity::gestalt_hash` when full-content change detection is
/// needed instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Hash32);

impl PeerId {
    /// Derive a peer id from raw public signing key bytes.
    pub fn from_signing_key(public_key: &[u8]) -> Self {
        let mut labeled = Vec::with_capacity(public_key.len() + 16);
        labeled.extend_from_slice(b"orbit-peer-id:");
        labeled.extend_from_slice(public_key);
        Self(hash(&labeled))
    }

    /// The underlying fingerprint digest.
    pub fn fingerprint(&self) -> Hash32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0.short())
    }
}

/// An independent synchronization domain with its own key hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(String);

impl ZoneId {
    /// Create a zone id from a name such as `"passwords"`.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The zone name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone-{}", self.0)
    }
}

impl FromStr for ZoneId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s.strip_prefix("zone-").unwrap_or(s)))
    }
}

/// Stable identifier of one secret record, unchanged across updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Create a fresh random record id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The inner UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record-{}", self.0)
    }
}

/// Identifier of one out-of-band pairing exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(pub Uuid);

impl ExchangeId {
    /// Create a fresh random exchange id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The inner UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exchange-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_depends_only_on_signing_key() {
        let a = PeerId::from_signing_key(&[1u8; 32]);
        let b = PeerId::from_signing_key(&[1u8; 32]);
        let c = PeerId::from_signing_key(&[2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zone_id_round_trips_through_display() {
        let zone = ZoneId::new("passwords");
        let parsed: ZoneId = zone.to_string().parse().unwrap();
        assert_eq!(zone, parsed);
    }

    #[test]
    fn record_ids_are_unique() {
        assert_ne!(RecordId::new(), RecordId::new());
    }
}
