//! Per-zone reconciliation state.
//!
//! Everything a zone actor owns lives here, and every transition is a
//! synchronous method so the logic is testable without a runtime. The
//! actor shell in [`crate::actor`] is responsible only for serialization,
//! suspension points, and retries.
//!
//! `apply_change_set` stages all changes on a scratch copy and commits
//! atomically: a call either applies as a whole or not at all. Individual
//! records that fail integrity checks are dropped with a warning and do
//! not abort the rest, per the fail-closed propagation policy.

use orbit_core::{Hash32, OrbitError, PeerId, RecordId, Result, ZoneId};
use orbit_crypto::KeyVault;
use orbit_keys::{recover_zone_key, share_zone_key, KeyShare, ShareLog, ZoneKey, ZoneKeyId};
use orbit_records::{PendingManifest, SecretRecord, ZoneManifest};
use orbit_store::{
    ChangeSet, ChangeToken, StoredRecord, SyncedRecord, WriteOp, ZoneSnapshot,
};
use orbit_trust::{Circle, CircleStanding};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Reconciliation phase of one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZonePhase {
    /// Nothing in flight.
    Idle,
    /// Fetching changes from the record store.
    Fetching,
    /// Applying a fetched change set.
    Reconciling,
    /// Rotating the zone key after a membership removal.
    ReKeying,
    /// The last sync attempt failed terminally; waiting for `sync_now`.
    Error,
}

/// A local write waiting to be pushed.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    /// A circle successor (join, accept, leave, reset).
    Circle(Circle),
    /// A freshly issued key share.
    Share(KeyShare),
    /// A new or updated secret record.
    Secret(SecretRecord),
    /// A sealed manifest.
    Manifest(ZoneManifest),
}

impl PendingWrite {
    fn body(&self) -> SyncedRecord {
        match self {
            Self::Circle(c) => SyncedRecord::Circle(c.clone()),
            Self::Share(s) => SyncedRecord::KeyShare(s.clone()),
            Self::Secret(r) => SyncedRecord::Secret(r.clone()),
            Self::Manifest(m) => SyncedRecord::Manifest(m.clone()),
        }
    }

    /// Store-level name this write targets.
    pub fn record_name(&self) -> String {
        self.body().record_name()
    }
}

/// What applying a change set did.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Records applied.
    pub applied: usize,
    /// Records dropped by integrity checks.
    pub dropped: usize,
    /// Members present before and gone after; non-empty triggers
    /// re-keying.
    pub removed_members: Vec<PeerId>,
    /// Whether the circle changed.
    pub circle_updated: bool,
}

/// All state owned by one zone actor.
pub struct ZoneState {
    /// The zone this state belongs to.
    pub zone: ZoneId,
    /// Last accepted circle.
    pub circle: Option<Circle>,
    /// Append-only share log.
    pub share_log: ShareLog,
    /// Decrypted-format records held locally, keyed by record id.
    pub records: BTreeMap<RecordId, SecretRecord>,
    /// Store etags by record name, for compare-and-swap pushes.
    pub etags: BTreeMap<String, Hash32>,
    /// Latest manifest accepted as authoritative.
    pub current_manifest: Option<ZoneManifest>,
    /// Local knowledge not yet confirmed by the store.
    pub pending_manifest: PendingManifest,
    /// Unwrapped zone keys, past and present, keyed by key id.
    pub keys: BTreeMap<ZoneKeyId, ZoneKey>,
    /// The key new records are written under.
    pub current_key: Option<ZoneKeyId>,
    /// Cursor for the next incremental fetch.
    pub last_token: Option<ChangeToken>,
    /// Reconciliation phase.
    pub phase: ZonePhase,
    /// Writes awaiting push.
    pub pending_writes: Vec<PendingWrite>,
    /// Secrets accepted while no usable zone key was available; encrypted
    /// and queued as soon as one is.
    pub held_plaintexts: Vec<(RecordId, Vec<u8>)>,
    /// Set when push retries were exhausted; cleared by the next
    /// successful sync.
    pub stalled: bool,
}

impl ZoneState {
    /// Fresh state for a zone never seen before.
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            circle: None,
            share_log: ShareLog::new(),
            records: BTreeMap::new(),
            etags: BTreeMap::new(),
            current_manifest: None,
            pending_manifest: PendingManifest::new(),
            keys: BTreeMap::new(),
            current_key: None,
            last_token: None,
            phase: ZonePhase::Idle,
            pending_writes: Vec::new(),
            held_plaintexts: Vec::new(),
            stalled: false,
        }
    }

    /// Restore from a persisted snapshot. Unwrapped keys are not
    /// persisted; they are re-recovered from the share log.
    pub fn from_snapshot(zone: ZoneId, snapshot: ZoneSnapshot, circle: Option<Circle>) -> Self {
        let mut state = Self::new(zone);
        state.current_manifest = snapshot.current_manifest;
        state.pending_manifest = snapshot.pending_manifest;
        state.share_log = snapshot.share_log;
        state.last_token = snapshot.last_token;
        state.circle = circle;
        state
    }

    /// Snapshot the persistable parts.
    pub fn to_snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            current_manifest: self.current_manifest.clone(),
            pending_manifest: self.pending_manifest.clone(),
            share_log: self.share_log.clone(),
            last_token: self.last_token,
        }
    }

    /// A peer's standing in the last accepted circle.
    pub fn standing_of(&self, peer: &PeerId) -> CircleStanding {
        match &self.circle {
            Some(circle) => circle.standing_of(peer),
            None => CircleStanding::NoCircle,
        }
    }

    /// The zone key new records are written under, when usable.
    pub fn writing_key(&self) -> Option<&ZoneKey> {
        self.current_key.as_ref().and_then(|id| self.keys.get(id))
    }

    /// Apply a fetched change set: circle before shares before secrets
    /// before manifests, staged and committed atomically.
    ///
    /// `full` marks a full refetch, which is authoritative about absence:
    /// local records the store no longer holds (and that have no pending
    /// write) are dropped.
    pub fn apply_change_set(&mut self, set: &ChangeSet, full: bool) -> Result<ApplyOutcome> {
        if set.zone != self.zone {
            return Err(OrbitError::invalid(format!(
                "change set for {} applied to {}",
                set.zone, self.zone
            )));
        }

        let mut outcome = ApplyOutcome::default();

        // Stage onto scratch copies; nothing below touches self until the
        // commit block at the end.
        let mut circle = self.circle.clone();
        let mut share_log = self.share_log.clone();
        let mut records = self.records.clone();
        let mut etags = self.etags.clone();
        let mut current_manifest = self.current_manifest.clone();
        let mut pending_manifest = self.pending_manifest.clone();

        let mut upserts: Vec<&StoredRecord> = set.upserts.iter().collect();
        upserts.sort_by_key(|r| r.body.apply_rank());

        for stored in upserts {
            match &stored.body {
                SyncedRecord::Circle(incoming) => {
                    if circle.as_ref() == Some(incoming) {
                        // Same circle content; only refresh the etag.
                    } else {
                        match incoming.verify(circle.as_ref()) {
                            Ok(()) => {
                                if let Some(previous) = &circle {
                                    for id in previous.member_ids() {
                                        if !incoming.is_member(id) {
                                            outcome.removed_members.push(*id);
                                        }
                                    }
                                }
                                debug!(zone = %self.zone, generation = incoming.generation,
                                    "accepted circle");
                                circle = Some(incoming.clone());
                                outcome.circle_updated = true;
                            }
                            Err(error) => {
                                warn!(zone = %self.zone, %error, "dropped fetched circle");
                                outcome.dropped += 1;
                                continue;
                            }
                        }
                    }
                }
                SyncedRecord::KeyShare(share) => {
                    let sender_key = circle
                        .as_ref()
                        .and_then(|c| c.member_key(&share.sender));
                    let valid = match sender_key {
                        Some(key) => share.verify(&key),
                        None => Err(OrbitError::untrusted_sender(format!(
                            "share sender {} is not a circle member",
                            share.sender
                        ))),
                    };
                    match valid.and_then(|()| share_log.insert(share.clone())) {
                        Ok(()) => {}
                        Err(error) => {
                            warn!(zone = %self.zone, %error, "dropped fetched key share");
                            outcome.dropped += 1;
                            continue;
                        }
                    }
                }
                SyncedRecord::Secret(record) => {
                    if let Err(error) =
                        validate_secret(record, &self.zone, circle.as_ref(), &share_log)
                    {
                        warn!(zone = %self.zone, record = %record.record_id, %error,
                            "dropped fetched record");
                        outcome.dropped += 1;
                        continue;
                    }
                    pending_manifest.upsert(record);
                    records.insert(record.record_id, record.clone());
                }
                SyncedRecord::Manifest(manifest) => {
                    let valid = match &circle {
                        Some(circle) => manifest.validate(circle),
                        None => Err(OrbitError::untrusted_sender(
                            "manifest arrived before any circle",
                        )),
                    };
                    match valid {
                        Ok(()) => {
                            let supersedes = current_manifest
                                .as_ref()
                                .map_or(true, |m| manifest.generation >= m.generation);
                            if supersedes {
                                current_manifest = Some(manifest.clone());
                            }
                        }
                        Err(error) => {
                            warn!(zone = %self.zone, %error, "dropped fetched manifest");
                            outcome.dropped += 1;
                            continue;
                        }
                    }
                }
            }
            if let Some(etag) = stored.base_etag {
                etags.insert(stored.name.clone(), etag);
            }
            outcome.applied += 1;
        }

        for name in &set.deletes {
            etags.remove(name);
            if let Some(id) = record_id_from_name(name) {
                records.remove(&id);
                pending_manifest.remove(&id);
            }
        }

        if full {
            let fetched: std::collections::BTreeSet<&str> =
                set.upserts.iter().map(|r| r.name.as_str()).collect();
            let pending: std::collections::BTreeSet<String> =
                self.pending_writes.iter().map(|w| w.record_name()).collect();
            let stale: Vec<RecordId> = records
                .values()
                .filter(|r| {
                    let name = format!("record:{}", r.record_id);
                    !fetched.contains(name.as_str()) && !pending.contains(&name)
                })
                .map(|r| r.record_id)
                .collect();
            for id in stale {
                records.remove(&id);
                pending_manifest.remove(&id);
                etags.remove(&format!("record:{id}"));
            }
        }

        // Commit.
        self.circle = circle;
        self.share_log = share_log;
        self.records = records;
        self.etags = etags;
        self.current_manifest = current_manifest;
        self.pending_manifest = pending_manifest;
        self.last_token = Some(set.token);
        Ok(outcome)
    }

    /// Try to make a zone key usable: recover from the share log, or, as
    /// a founding member with no shares at all, mint the first key and
    /// queue shares for every member.
    pub fn ensure_zone_key<R: RngCore + CryptoRng>(
        &mut self,
        vault: &dyn KeyVault,
        rng: &mut R,
    ) -> Result<()> {
        let own_id = vault.peer_id();
        let circle = match &self.circle {
            Some(circle) if circle.is_member(&own_id) => circle.clone(),
            _ => return Ok(()), // Nothing to do outside the circle.
        };

        if let Some(best) = self.share_log.best_for(&own_id) {
            let already_current = self
                .writing_key()
                .is_some_and(|k| k.key_id == best.share.zone_key_id);
            if !already_current {
                let trusted = circle
                    .members
                    .iter()
                    .map(|(id, m)| (*id, m.signing_public.clone()))
                    .collect();
                let key =
                    recover_zone_key(&best.share, best.poisoned(), vault, &trusted)?;
                self.current_key = Some(key.key_id);
                self.keys.insert(key.key_id, key);
            }
        } else if self.share_log.is_empty() {
            // First member in a fresh zone: mint and share.
            let key = ZoneKey::generate(self.zone.clone(), 1, rng);
            debug!(zone = %self.zone, key = %key.key_id, "minting initial zone key");
            self.issue_shares(&key, &circle, vault, rng)?;
            self.current_key = Some(key.key_id);
            self.keys.insert(key.key_id, key);
        }

        self.flush_held(vault, rng)?;
        Ok(())
    }

    /// Rotate the zone key after a membership removal: mint the successor,
    /// share it with every remaining member, and re-encrypt all records
    /// under it. Prior shares become poisoned by supersession.
    pub fn rekey<R: RngCore + CryptoRng>(
        &mut self,
        vault: &dyn KeyVault,
        rng: &mut R,
    ) -> Result<()> {
        let circle = self
            .circle
            .clone()
            .ok_or_else(|| OrbitError::invalid("cannot re-key without a circle"))?;
        let current = self
            .writing_key()
            .cloned()
            .ok_or_else(|| OrbitError::invalid("cannot re-key without the current key"))?;

        let next = current.rotated(rng);
        debug!(zone = %self.zone, from = %current.key_id, to = %next.key_id, "re-keying zone");
        self.issue_shares(&next, &circle, vault, rng)?;

        let ids: Vec<RecordId> = self.records.keys().copied().collect();
        for id in ids {
            let record = self.records.get(&id).cloned();
            let Some(record) = record else { continue };
            let old_key = match self.keys.get(&record.parent_key_id) {
                Some(key) => key.clone(),
                None => {
                    warn!(zone = %self.zone, record = %id,
                        "cannot re-encrypt record under unknown key");
                    continue;
                }
            };
            let rekeyed = record.rekeyed(&old_key, &next, rng)?;
            self.pending_manifest.upsert(&rekeyed);
            self.records.insert(id, rekeyed.clone());
            self.pending_writes
                .retain(|w| !matches!(w, PendingWrite::Secret(r) if r.record_id == id));
            self.pending_writes.push(PendingWrite::Secret(rekeyed));
        }

        self.current_key = Some(next.key_id);
        self.keys.insert(next.key_id, next);
        self.flush_held(vault, rng)?;
        Ok(())
    }

    /// Share the current key with any circle member that has no live
    /// share for it, at the current epoch. Covers members accepted after
    /// the key was minted; additions never rotate.
    pub fn ensure_member_shares<R: RngCore + CryptoRng>(
        &mut self,
        vault: &dyn KeyVault,
        rng: &mut R,
    ) -> Result<()> {
        let Some(key) = self.writing_key().cloned() else {
            return Ok(());
        };
        let Some(circle) = self.circle.clone() else {
            return Ok(());
        };
        if !circle.is_member(&vault.peer_id()) {
            return Ok(());
        }
        let epoch = self.share_log.current_epoch().max(1);
        for member in circle.members.values() {
            let covered = self
                .share_log
                .entries_for_key(&key.key_id)
                .any(|e| !e.poisoned() && e.share.receiver == member.peer_id);
            if !covered {
                let share = share_zone_key(&key, vault, member, epoch, rng)?;
                self.share_log.insert(share.clone())?;
                self.pending_writes.push(PendingWrite::Share(share));
            }
        }
        Ok(())
    }

    fn issue_shares<R: RngCore + CryptoRng>(
        &mut self,
        key: &ZoneKey,
        circle: &Circle,
        vault: &dyn KeyVault,
        rng: &mut R,
    ) -> Result<()> {
        let epoch = self.share_log.current_epoch() + 1;
        for member in circle.members.values() {
            let share = share_zone_key(key, vault, member, epoch, rng)?;
            self.share_log.insert(share.clone())?;
            self.pending_writes.push(PendingWrite::Share(share));
        }
        Ok(())
    }

    /// Accept a new secret locally. Returns the record id immediately;
    /// the write is encrypted and queued now when a key is usable, or
    /// held until one is.
    pub fn put_secret<R: RngCore + CryptoRng>(
        &mut self,
        plaintext: Vec<u8>,
        rng: &mut R,
    ) -> Result<RecordId> {
        let record_id = RecordId::new();
        if self.phase == ZonePhase::ReKeying {
            self.held_plaintexts.push((record_id, plaintext));
            return Ok(record_id);
        }
        match self.writing_key().cloned() {
            Some(key) => self.enqueue_secret(&key, record_id, &plaintext, rng)?,
            None => self.held_plaintexts.push((record_id, plaintext)),
        }
        Ok(record_id)
    }

    fn enqueue_secret<R: RngCore + CryptoRng>(
        &mut self,
        key: &ZoneKey,
        record_id: RecordId,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<()> {
        let generation = self
            .records
            .get(&record_id)
            .map_or(1, |r| r.generation + 1);
        let record = SecretRecord::encrypt(plaintext, key, record_id, generation, rng)?;
        self.pending_manifest.upsert(&record);
        self.records.insert(record_id, record.clone());
        // A newer write to the same record supersedes any queued one.
        self.pending_writes
            .retain(|w| !matches!(w, PendingWrite::Secret(r) if r.record_id == record_id));
        self.pending_writes.push(PendingWrite::Secret(record));
        Ok(())
    }

    fn flush_held<R: RngCore + CryptoRng>(
        &mut self,
        _vault: &dyn KeyVault,
        rng: &mut R,
    ) -> Result<()> {
        let Some(key) = self.writing_key().cloned() else {
            return Ok(());
        };
        if self.phase == ZonePhase::ReKeying {
            return Ok(());
        }
        for (record_id, plaintext) in std::mem::take(&mut self.held_plaintexts) {
            self.enqueue_secret(&key, record_id, &plaintext, rng)?;
        }
        Ok(())
    }

    /// Decrypt a held record.
    pub fn get_secret(&self, record_id: &RecordId) -> Result<Vec<u8>> {
        let record = self.records.get(record_id).ok_or_else(|| {
            OrbitError::not_found(format!("{record_id} is not present in {}", self.zone))
        })?;
        let key = self.keys.get(&record.parent_key_id).ok_or_else(|| {
            OrbitError::decrypt(format!(
                "no unwrapped key for {} (wrapped by {})",
                record_id, record.parent_key_id
            ))
        })?;
        record.decrypt(key)
    }

    /// Seal the pending manifest and queue it, when the local record set
    /// is known and differs from what we last published.
    pub fn queue_manifest(&mut self, vault: &dyn KeyVault) -> Result<()> {
        let Some(circle) = &self.circle else {
            return Ok(());
        };
        if !circle.is_member(&vault.peer_id()) {
            return Ok(());
        }
        let manifest = self
            .pending_manifest
            .seal(&self.zone, circle.generation, vault)?;
        let already_published = self
            .current_manifest
            .as_ref()
            .is_some_and(|m| m.signer == manifest.signer && m.digest == manifest.digest
                && m.generation == manifest.generation);
        let already_queued = self.pending_writes.iter().any(|w| {
            matches!(w, PendingWrite::Manifest(m)
                if m.digest == manifest.digest && m.generation == manifest.generation)
        });
        if !already_published && !already_queued {
            self.pending_writes.push(PendingWrite::Manifest(manifest));
        }
        Ok(())
    }

    /// Materialize pending writes as store operations with current etags.
    pub fn build_write_ops(&self) -> Vec<WriteOp> {
        self.pending_writes
            .iter()
            .map(|write| {
                let body = write.body();
                let name = body.record_name();
                let base_etag = self.etags.get(&name).copied();
                WriteOp::Upsert(StoredRecord {
                    zone: self.zone.clone(),
                    name,
                    body,
                    base_etag,
                })
            })
            .collect()
    }

    /// Record a successful push: update etags, drop the pushed writes,
    /// and promote a pushed manifest to current.
    pub fn mark_pushed(&mut self, accepted: &[(String, Hash32)]) {
        let accepted_names: BTreeMap<&str, Hash32> = accepted
            .iter()
            .map(|(name, etag)| (name.as_str(), *etag))
            .collect();
        for (name, etag) in &accepted_names {
            self.etags.insert((*name).to_string(), *etag);
        }
        let mut remaining = Vec::new();
        for write in std::mem::take(&mut self.pending_writes) {
            let name = write.record_name();
            if accepted_names.contains_key(name.as_str()) {
                if let PendingWrite::Manifest(manifest) = &write {
                    self.current_manifest = Some(manifest.clone());
                }
            } else {
                remaining.push(write);
            }
        }
        self.pending_writes = remaining;
    }

    /// Rebase pending writes on freshly fetched state after a version
    /// conflict. Writes the remote side has made obsolete are dropped;
    /// the rest pick up current etags at build time.
    pub fn rebase_pending(&mut self) {
        let circle_generation = self.circle.as_ref().map(|c| c.generation);
        let current_epoch = self.share_log.current_epoch();
        self.pending_writes.retain(|write| match write {
            PendingWrite::Circle(ours) => match circle_generation {
                // The store moved past our intended successor; the
                // operation that queued it must re-derive its intent.
                Some(current) => ours.generation > current,
                None => true,
            },
            PendingWrite::Share(share) => share.epoch >= current_epoch,
            PendingWrite::Secret(record) => {
                let remote = self.records.get(&record.record_id);
                match remote {
                    // Remote copy is newer: last writer wins, drop ours.
                    Some(theirs) if theirs.generation > record.generation => false,
                    _ => true,
                }
            }
            PendingWrite::Manifest(_) => false, // Re-sealed after rebase.
        });
    }
}

fn validate_secret(
    record: &SecretRecord,
    zone: &ZoneId,
    circle: Option<&Circle>,
    share_log: &ShareLog,
) -> Result<()> {
    if record.zone != *zone {
        return Err(OrbitError::invalid(format!(
            "record belongs to {}, not {zone}",
            record.zone
        )));
    }
    let circle = circle.ok_or_else(|| {
        OrbitError::untrusted_sender("record arrived before any circle")
    })?;
    let anchored = share_log
        .entries_for_key(&record.parent_key_id)
        .any(|entry| !entry.poisoned() && circle.is_member(&entry.share.sender));
    if !anchored {
        return Err(OrbitError::untrusted_sender(format!(
            "record {} is wrapped by {} which no circle member shared",
            record.record_id, record.parent_key_id
        )));
    }
    Ok(())
}

fn record_id_from_name(name: &str) -> Option<RecordId> {
    // Secret records are stored as `record:record-<uuid>`.
    name.strip_prefix("record:record-")
        .and_then(|s| s.parse::<uuid::Uuid>().ok())
        .map(RecordId::from_uuid)
}
