//! Append-only per-zone share log.
//!
//! Shares are never edited in place. Inserting a share at a higher epoch
//! marks every lower-epoch share superseded; a superseded share reads as
//! poisoned. The log keeps superseded entries forever so a late-arriving
//! peer finds a poisoned share (detectable revocation) rather than
//! nothing.

use crate::share::KeyShare;
use crate::zone_key::ZoneKeyId;
use orbit_core::{hash, Canonical, Hash32, OrbitError, PeerId, Result, ZoneId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One log entry: a share plus its supersession marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedShare {
    /// The immutable share as issued.
    pub share: KeyShare,
    /// The epoch that superseded this share, if any.
    pub superseded_by: Option<u64>,
}

impl LoggedShare {
    /// True when this share must not be trusted even though present.
    pub fn poisoned(&self) -> bool {
        self.superseded_by.is_some()
    }
}

/// Append-only log of the key shares seen for one zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLog {
    zone: Option<ZoneId>,
    entries: Vec<LoggedShare>,
}

impl ShareLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest epoch seen for this zone, or 0 when the log is empty.
    pub fn current_epoch(&self) -> u64 {
        self.entries.iter().map(|e| e.share.epoch).max().unwrap_or(0)
    }

    /// Insert a share, marking lower-epoch entries superseded.
    ///
    /// Idempotent: re-inserting a share already present (by content hash)
    /// changes nothing. Inserting an old-epoch share records it already
    /// superseded.
    pub fn insert(&mut self, share: KeyShare) -> Result<()> {
        match &self.zone {
            Some(zone) if *zone != share.zone => {
                return Err(OrbitError::invalid(format!(
                    "share for {} inserted into log for {zone}",
                    share.zone
                )))
            }
            Some(_) => {}
            None => self.zone = Some(share.zone.clone()),
        }

        let fingerprint = share_fingerprint(&share);
        if self
            .entries
            .iter()
            .any(|e| share_fingerprint(&e.share) == fingerprint)
        {
            return Ok(());
        }

        let current = self.current_epoch();
        if share.epoch > current {
            for entry in &mut self.entries {
                if entry.share.epoch < share.epoch && entry.superseded_by.is_none() {
                    entry.superseded_by = Some(share.epoch);
                }
            }
            debug!(zone = %share.zone, epoch = share.epoch, "share log advanced to new epoch");
        }

        let superseded_by = (share.epoch < current).then_some(current);
        self.entries.push(LoggedShare {
            share,
            superseded_by,
        });
        Ok(())
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[LoggedShare] {
        &self.entries
    }

    /// Entries carrying a specific zone key version.
    pub fn entries_for_key(&self, key_id: &ZoneKeyId) -> impl Iterator<Item = &LoggedShare> {
        let key_id = *key_id;
        self.entries
            .iter()
            .filter(move |e| e.share.zone_key_id == key_id)
    }

    /// The share a receiver should try first: highest epoch addressed to
    /// `receiver`, preferring unpoisoned entries.
    ///
    /// When only poisoned shares exist the newest of them is returned, so
    /// recovery surfaces `Poisoned` ("you were once trusted, now revoked")
    /// rather than `NotFound`.
    pub fn best_for(&self, receiver: &PeerId) -> Option<&LoggedShare> {
        let mine = || self.entries.iter().filter(|e| e.share.receiver == *receiver);
        mine()
            .filter(|e| !e.poisoned())
            .max_by_key(|e| e.share.epoch)
            .or_else(|| mine().max_by_key(|e| e.share.epoch))
    }

    /// Number of entries in the log.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no shares have been logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn share_fingerprint(share: &KeyShare) -> Hash32 {
    let mut image = share.canonical_bytes();
    image.extend_from_slice(&share.signature.0);
    hash(&image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::share_zone_key;
    use crate::zone_key::ZoneKey;
    use orbit_crypto::SoftwareVault;
    use orbit_trust::PeerIdentity;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn device(seed: u8) -> (PeerIdentity, SoftwareVault) {
        let vault = SoftwareVault::from_seed([seed; 32]);
        let identity =
            PeerIdentity::create(vec![("name".into(), format!("dev-{seed}"))], &vault).unwrap();
        (identity, vault)
    }

    #[test]
    fn rotation_poisons_prior_epochs() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let (receiver, _) = device(2);
        let (_, sender_vault) = device(1);

        let v1 = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let v2 = v1.rotated(&mut rng);

        let mut log = ShareLog::new();
        log.insert(share_zone_key(&v1, &sender_vault, &receiver, 1, &mut rng).unwrap())
            .unwrap();
        assert!(!log.entries()[0].poisoned());

        log.insert(share_zone_key(&v2, &sender_vault, &receiver, 2, &mut rng).unwrap())
            .unwrap();

        let old: Vec<_> = log.entries_for_key(&v1.key_id).collect();
        assert!(old.iter().all(|e| e.poisoned()));
        let new: Vec<_> = log.entries_for_key(&v2.key_id).collect();
        assert!(new.iter().all(|e| !e.poisoned()));
    }

    #[test]
    fn best_for_prefers_highest_unpoisoned_epoch() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let (receiver, _) = device(2);
        let (_, sender_vault) = device(1);

        let v1 = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let v2 = v1.rotated(&mut rng);

        let mut log = ShareLog::new();
        log.insert(share_zone_key(&v1, &sender_vault, &receiver, 1, &mut rng).unwrap())
            .unwrap();
        log.insert(share_zone_key(&v2, &sender_vault, &receiver, 2, &mut rng).unwrap())
            .unwrap();

        let best = log.best_for(&receiver.peer_id).unwrap();
        assert_eq!(best.share.epoch, 2);
        assert!(!best.poisoned());
    }

    #[test]
    fn revoked_receiver_still_sees_poisoned_share() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let (keeper, _) = device(2);
        let (revoked, _) = device(3);
        let (_, sender_vault) = device(1);

        let v1 = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let v2 = v1.rotated(&mut rng);

        let mut log = ShareLog::new();
        log.insert(share_zone_key(&v1, &sender_vault, &keeper, 1, &mut rng).unwrap())
            .unwrap();
        log.insert(share_zone_key(&v1, &sender_vault, &revoked, 1, &mut rng).unwrap())
            .unwrap();
        // Rotation shares the new key only with the keeper.
        log.insert(share_zone_key(&v2, &sender_vault, &keeper, 2, &mut rng).unwrap())
            .unwrap();

        let best = log.best_for(&revoked.peer_id).unwrap();
        assert!(best.poisoned());
    }

    #[test]
    fn insert_is_idempotent() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let (receiver, _) = device(2);
        let (_, sender_vault) = device(1);

        let v1 = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let share = share_zone_key(&v1, &sender_vault, &receiver, 1, &mut rng).unwrap();

        let mut log = ShareLog::new();
        log.insert(share.clone()).unwrap();
        log.insert(share).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn late_arriving_old_epoch_lands_poisoned() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let (receiver, _) = device(2);
        let (_, sender_vault) = device(1);

        let v1 = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let v2 = v1.rotated(&mut rng);

        let mut log = ShareLog::new();
        log.insert(share_zone_key(&v2, &sender_vault, &receiver, 2, &mut rng).unwrap())
            .unwrap();
        log.insert(share_zone_key(&v1, &sender_vault, &receiver, 1, &mut rng).unwrap())
            .unwrap();

        let old: Vec<_> = log.entries_for_key(&v1.key_id).collect();
        assert!(old[0].poisoned());
    }

    #[test]
    fn zone_mismatch_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let (receiver, _) = device(2);
        let (_, sender_vault) = device(1);

        let passwords = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let notes = ZoneKey::generate(ZoneId::new("notes"), 1, &mut rng);

        let mut log = ShareLog::new();
        log.insert(share_zone_key(&passwords, &sender_vault, &receiver, 1, &mut rng).unwrap())
            .unwrap();
        let err = log
            .insert(share_zone_key(&notes, &sender_vault, &receiver, 1, &mut rng).unwrap())
            .unwrap_err();
        assert!(matches!(err, OrbitError::Invalid { .. }));
    }
}
