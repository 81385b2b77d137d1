//! Signed zone manifests.
//!
//! A manifest digests the uuid-sorted `(record id, record hash)` pairs a
//! peer believes exist in a zone. Determinism matters: two peers holding
//! the same record set must produce byte-identical manifests, which is why
//! entries live in a `BTreeMap` and the digest folds them in sorted order.

use crate::record::SecretRecord;
use orbit_core::{hasher, Canon, Canonical, ExtraFields, Hash32, OrbitError, PeerId, RecordId,
    Result, ZoneId};
use orbit_crypto::{verify_signature, KeyVault, Signature};
use orbit_trust::Circle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

const MANIFEST_DOMAIN: &str = "orbit-manifest-v1";

/// A signed digest over a zone's record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneManifest {
    /// The zone this manifest covers.
    pub zone: ZoneId,
    /// The peer that built and signed this manifest.
    pub signer: PeerId,
    /// Circle generation this manifest was built at.
    pub generation: u64,
    /// Digest over the sorted entry set.
    pub digest: Hash32,
    /// The covered `(record id, record hash)` pairs.
    pub entries: BTreeMap<RecordId, Hash32>,
    /// Unknown fields carried verbatim inside the signed image.
    pub extra_fields: ExtraFields,
    /// Signer's signature over the canonical bytes.
    pub signature: Signature,
}

impl Canonical for ZoneManifest {
    fn canonical_bytes(&self) -> Vec<u8> {
        Canon::new(MANIFEST_DOMAIN)
            .str(self.zone.as_str())
            .bytes(self.signer.fingerprint().as_bytes())
            .u64(self.generation)
            .bytes(self.digest.as_bytes())
            .u64(self.entries.len() as u64)
            .extra(&self.extra_fields)
            .finish()
    }
}

impl ZoneManifest {
    /// Build and sign a manifest over `records` at `generation`.
    ///
    /// The digest is computed deterministically from the uuid-sorted
    /// record set, so the inputs may arrive in any order.
    pub fn build(
        zone: &ZoneId,
        records: &[SecretRecord],
        generation: u64,
        signer: &dyn KeyVault,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for record in records {
            if record.zone != *zone {
                return Err(OrbitError::invalid(format!(
                    "record {} belongs to {}, not {zone}",
                    record.record_id, record.zone
                )));
            }
            entries.insert(record.record_id, record.record_hash());
        }
        let digest = digest_entries(&entries);
        let mut manifest = Self {
            zone: zone.clone(),
            signer: signer.peer_id(),
            generation,
            digest,
            entries,
            extra_fields: Vec::new(),
            signature: Signature(Vec::new()),
        };
        manifest.signature = signer.sign(&manifest.canonical_bytes())?;
        Ok(manifest)
    }

    /// Validate this manifest against the circle at its generation.
    ///
    /// Fails closed: a signer outside the circle, a digest that does not
    /// match the claimed entries, or a bad signature all reject the
    /// manifest, and it must never be promoted from pending to current.
    pub fn validate(&self, circle: &Circle) -> Result<()> {
        let signer_key = circle.member_key(&self.signer).ok_or_else(|| {
            warn!(zone = %self.zone, signer = %self.signer, "manifest signer not in circle");
            OrbitError::untrusted_sender(format!(
                "manifest signer {} is not a circle member",
                self.signer
            ))
        })?;

        if digest_entries(&self.entries) != self.digest {
            return Err(OrbitError::signature_invalid(format!(
                "manifest digest for {} does not cover its claimed entries",
                self.zone
            )));
        }

        verify_signature(&signer_key, &self.canonical_bytes(), &self.signature)
    }

    /// Whether the manifest covers a record id.
    pub fn item_exists(&self, record_id: &RecordId) -> bool {
        self.entries.contains_key(record_id)
    }

    /// Number of records covered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the manifest covers no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Locally accumulated record knowledge not yet confirmed by the store.
///
/// Sealed into a [`ZoneManifest`] once the state it describes has been
/// pushed; until then it is never treated as authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingManifest {
    entries: BTreeMap<RecordId, Hash32>,
}

impl PendingManifest {
    /// Start with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an accepted manifest's entries.
    pub fn from_manifest(manifest: &ZoneManifest) -> Self {
        Self {
            entries: manifest.entries.clone(),
        }
    }

    /// Record (or update) one record's hash.
    pub fn upsert(&mut self, record: &SecretRecord) {
        self.entries.insert(record.record_id, record.record_hash());
    }

    /// Forget a record.
    pub fn remove(&mut self, record_id: &RecordId) {
        self.entries.remove(record_id);
    }

    /// Seal the accumulated knowledge into a signed manifest.
    pub fn seal(
        &self,
        zone: &ZoneId,
        generation: u64,
        signer: &dyn KeyVault,
    ) -> Result<ZoneManifest> {
        let digest = digest_entries(&self.entries);
        let mut manifest = ZoneManifest {
            zone: zone.clone(),
            signer: signer.peer_id(),
            generation,
            digest,
            entries: self.entries.clone(),
            extra_fields: Vec::new(),
            signature: Signature(Vec::new()),
        };
        manifest.signature = signer.sign(&manifest.canonical_bytes())?;
        Ok(manifest)
    }

    /// Number of accumulated entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has accumulated.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The minimal repair set between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    /// Present in `b` but not `a`.
    pub added: Vec<RecordId>,
    /// Present in `a` but not `b`.
    pub removed: Vec<RecordId>,
    /// Present in both with differing hashes.
    pub changed: Vec<RecordId>,
}

impl ManifestDiff {
    /// True when the manifests cover identical record sets.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compute the repair set turning `a`'s record set into `b`'s.
pub fn diff(a: &ZoneManifest, b: &ZoneManifest) -> ManifestDiff {
    let mut out = ManifestDiff::default();
    for (id, hash_b) in &b.entries {
        match a.entries.get(id) {
            None => out.added.push(*id),
            Some(hash_a) if hash_a != hash_b => out.changed.push(*id),
            Some(_) => {}
        }
    }
    for id in a.entries.keys() {
        if !b.entries.contains_key(id) {
            out.removed.push(*id);
        }
    }
    out
}

fn digest_entries(entries: &BTreeMap<RecordId, Hash32>) -> Hash32 {
    // BTreeMap iterates in uuid order; fold each pair length-delimited.
    let mut h = hasher();
    h.update(MANIFEST_DOMAIN.as_bytes());
    h.update(&(entries.len() as u64).to_be_bytes());
    for (id, record_hash) in entries {
        h.update(id.uuid().as_bytes());
        h.update(record_hash.as_bytes());
    }
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_crypto::SoftwareVault;
    use orbit_keys::ZoneKey;
    use orbit_trust::PeerIdentity;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn device(seed: u8) -> (PeerIdentity, SoftwareVault) {
        let vault = SoftwareVault::from_seed([seed; 32]);
        let identity =
            PeerIdentity::create(vec![("name".into(), format!("dev-{seed}"))], &vault).unwrap();
        (identity, vault)
    }

    fn records(n: u64, key: &ZoneKey, rng: &mut ChaCha20Rng) -> Vec<SecretRecord> {
        (0..n)
            .map(|i| {
                SecretRecord::encrypt(format!("secret-{i}").as_bytes(), key, RecordId::new(), 1, rng)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn same_record_set_gives_identical_manifests() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let (x, x_vault) = device(1);
        let zone = ZoneId::new("passwords");
        let key = ZoneKey::generate(zone.clone(), 1, &mut rng);
        let mut set = records(5, &key, &mut rng);

        let a = ZoneManifest::build(&zone, &set, 1, &x_vault).unwrap();
        set.reverse();
        let b = ZoneManifest::build(&zone, &set, 1, &x_vault).unwrap();

        assert_eq!(a.digest, b.digest);
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.signer, x.peer_id);
    }

    #[test]
    fn member_signed_manifest_validates() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let (x, x_vault) = device(1);
        let circle = Circle::found(&x, &x_vault).unwrap();
        let zone = ZoneId::new("passwords");
        let key = ZoneKey::generate(zone.clone(), 1, &mut rng);

        let manifest =
            ZoneManifest::build(&zone, &records(3, &key, &mut rng), 1, &x_vault).unwrap();
        manifest.validate(&circle).unwrap();
    }

    #[test]
    fn non_member_signer_fails_closed() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let (x, x_vault) = device(1);
        let (_, outsider_vault) = device(2);
        let circle = Circle::found(&x, &x_vault).unwrap();
        let zone = ZoneId::new("passwords");
        let key = ZoneKey::generate(zone.clone(), 1, &mut rng);

        let manifest =
            ZoneManifest::build(&zone, &records(2, &key, &mut rng), 1, &outsider_vault).unwrap();
        let err = manifest.validate(&circle).unwrap_err();
        assert!(matches!(err, OrbitError::UntrustedSender { .. }));
    }

    #[test]
    fn digest_mismatch_fails_closed() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let (x, x_vault) = device(1);
        let circle = Circle::found(&x, &x_vault).unwrap();
        let zone = ZoneId::new("passwords");
        let key = ZoneKey::generate(zone.clone(), 1, &mut rng);

        let mut manifest =
            ZoneManifest::build(&zone, &records(2, &key, &mut rng), 1, &x_vault).unwrap();
        manifest.entries.insert(RecordId::new(), Hash32::ZERO);
        assert!(manifest.validate(&circle).is_err());
    }

    #[test]
    fn diff_reports_the_minimal_repair_set() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let (_, x_vault) = device(1);
        let zone = ZoneId::new("passwords");
        let key = ZoneKey::generate(zone.clone(), 1, &mut rng);

        let mut set = records(3, &key, &mut rng);
        let a = ZoneManifest::build(&zone, &set, 1, &x_vault).unwrap();

        // Update one record, drop one, add one.
        let updated = SecretRecord::encrypt(b"new", &key, set[0].record_id, 2, &mut rng).unwrap();
        let dropped = set.remove(2);
        set[0] = updated;
        let added = SecretRecord::encrypt(b"extra", &key, RecordId::new(), 1, &mut rng).unwrap();
        set.push(added.clone());
        let b = ZoneManifest::build(&zone, &set, 1, &x_vault).unwrap();

        let d = diff(&a, &b);
        assert_eq!(d.added, vec![added.record_id]);
        assert_eq!(d.removed, vec![dropped.record_id]);
        assert_eq!(d.changed, vec![set[0].record_id]);
        assert!(diff(&a, &a).is_empty());
    }

    #[test]
    fn pending_manifest_seals_to_the_same_digest_as_build() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let (_, x_vault) = device(1);
        let zone = ZoneId::new("passwords");
        let key = ZoneKey::generate(zone.clone(), 1, &mut rng);
        let set = records(4, &key, &mut rng);

        let built = ZoneManifest::build(&zone, &set, 1, &x_vault).unwrap();

        let mut pending = PendingManifest::new();
        for record in &set {
            pending.upsert(record);
        }
        let sealed = pending.seal(&zone, 1, &x_vault).unwrap();
        assert_eq!(sealed.digest, built.digest);
    }

    #[test]
    fn item_exists_matches_entries() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let (_, x_vault) = device(1);
        let zone = ZoneId::new("passwords");
        let key = ZoneKey::generate(zone.clone(), 1, &mut rng);
        let set = records(1, &key, &mut rng);

        let manifest = ZoneManifest::build(&zone, &set, 1, &x_vault).unwrap();
        assert!(manifest.item_exists(&set[0].record_id));
        assert!(!manifest.item_exists(&RecordId::new()));
    }
}
