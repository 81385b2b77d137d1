//! Record and change-set types crossing the store boundary.

use orbit_core::{hash, to_vec, Hash32, PeerId, RecordId, Result, ZoneId};
use orbit_keys::KeyShare;
use orbit_records::{SecretRecord, ZoneManifest};
use orbit_trust::Circle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved record name under which a zone's circle is stored.
pub const CIRCLE_RECORD_NAME: &str = "circle";

/// One of the four synchronized record types.
///
/// The variants are ordered by application dependency: circles validate
/// key shares, key shares validate records, manifests are checked last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncedRecord {
    /// The membership circle.
    Circle(Circle),
    /// A wrapped zone key for one peer.
    KeyShare(KeyShare),
    /// An encrypted secret.
    Secret(SecretRecord),
    /// A signed digest over the zone's record set.
    Manifest(ZoneManifest),
}

impl SyncedRecord {
    /// Store-level name for this record; content-addressed for shares so
    /// a rotation writes new names instead of mutating old ones.
    pub fn record_name(&self) -> String {
        match self {
            Self::Circle(_) => CIRCLE_RECORD_NAME.to_string(),
            Self::KeyShare(share) => format!(
                "share:{}:{}:{}",
                share.zone_key_id, share.receiver, share.epoch
            ),
            Self::Secret(record) => format!("record:{}", record.record_id),
            Self::Manifest(manifest) => format!("manifest:{}", manifest.signer),
        }
    }

    /// Application order: circle before shares before secrets before
    /// manifests.
    pub fn apply_rank(&self) -> u8 {
        match self {
            Self::Circle(_) => 0,
            Self::KeyShare(_) => 1,
            Self::Secret(_) => 2,
            Self::Manifest(_) => 3,
        }
    }

    /// Compute the content etag the store assigns to this body.
    pub fn content_etag(&self) -> Result<Hash32> {
        Ok(hash(&to_vec(self)?))
    }

    /// The secret record id, for secret variants.
    pub fn secret_id(&self) -> Option<RecordId> {
        match self {
            Self::Secret(record) => Some(record.record_id),
            _ => None,
        }
    }

    /// The manifest signer, for manifest variants.
    pub fn manifest_signer(&self) -> Option<PeerId> {
        match self {
            Self::Manifest(manifest) => Some(manifest.signer),
            _ => None,
        }
    }
}

/// A record as held by (or destined for) the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// The zone the record lives in.
    pub zone: ZoneId,
    /// Store-level record name.
    pub name: String,
    /// The record body.
    pub body: SyncedRecord,
    /// The store version this write was based on; `None` expects to
    /// create the record. On fetched records this carries the current
    /// version.
    pub base_etag: Option<Hash32>,
}

impl StoredRecord {
    /// Wrap a body for writing, deriving its store name.
    pub fn write(zone: ZoneId, body: SyncedRecord, base_etag: Option<Hash32>) -> Self {
        let name = body.record_name();
        Self {
            zone,
            name,
            body,
            base_etag,
        }
    }
}

/// A write operation submitted to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Create or replace a record.
    Upsert(StoredRecord),
    /// Remove a record, conditional on its current version.
    Delete {
        /// Store-level record name.
        name: String,
        /// Version the delete was based on.
        base_etag: Hash32,
    },
}

impl WriteOp {
    /// The record name this operation targets.
    pub fn name(&self) -> &str {
        match self {
            Self::Upsert(record) => &record.name,
            Self::Delete { name, .. } => name,
        }
    }
}

/// Opaque change cursor issued by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeToken(pub u64);

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token-{}", self.0)
    }
}

/// The changes in a zone since a change token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// The zone the changes belong to.
    pub zone: ZoneId,
    /// Added or updated records, with their current etags.
    pub upserts: Vec<StoredRecord>,
    /// Names of removed records.
    pub deletes: Vec<String>,
    /// Cursor to resume from after applying this set.
    pub token: ChangeToken,
}

impl ChangeSet {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}
