//! Deterministic in-memory record store.
//!
//! Used by tests and the simulator path. Behaves like the real service in
//! the ways the engine depends on: per-zone change journal with pruning,
//! content etags, per-record compare-and-swap, and generation-monotonic
//! circle writes.

use crate::store::{FetchOutcome, RecordStore, SaveConflict, SaveOutcome};
use crate::types::{ChangeSet, ChangeToken, StoredRecord, SyncedRecord, WriteOp};
use async_trait::async_trait;
use orbit_core::{Hash32, OrbitError, Result, ZoneId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const DEFAULT_HISTORY_HORIZON: usize = 1024;
const NOTIFY_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Versioned {
    body: SyncedRecord,
    etag: Hash32,
}

#[derive(Debug, Clone)]
enum JournalChange {
    Upsert,
    Delete,
}

#[derive(Debug, Clone)]
struct JournalEntry {
    seq: u64,
    name: String,
    change: JournalChange,
}

struct ZoneData {
    records: BTreeMap<String, Versioned>,
    journal: VecDeque<JournalEntry>,
    seq: u64,
    /// Highest sequence number dropped from the journal; tokens at or
    /// below this are expired.
    pruned_upto: u64,
    notify: broadcast::Sender<ZoneId>,
}

impl ZoneData {
    fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            records: BTreeMap::new(),
            journal: VecDeque::new(),
            seq: 0,
            pruned_upto: 0,
            notify,
        }
    }
}

/// In-memory [`RecordStore`] implementation.
pub struct MemoryRecordStore {
    zones: RwLock<HashMap<ZoneId, ZoneData>>,
    history_horizon: usize,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    /// Create a store with the default history horizon.
    pub fn new() -> Self {
        Self {
            zones: RwLock::new(HashMap::new()),
            history_horizon: DEFAULT_HISTORY_HORIZON,
        }
    }

    /// Create a store that retains at most `horizon` journal entries per
    /// zone, so tests can exercise the token-expired full-refetch path.
    pub fn with_history_horizon(horizon: usize) -> Self {
        Self {
            zones: RwLock::new(HashMap::new()),
            history_horizon: horizon.max(1),
        }
    }

    /// Drop all retained history for a zone, expiring every outstanding
    /// change token.
    pub async fn prune_history(&self, zone: &ZoneId) -> Result<()> {
        let mut zones = self.zones.write().await;
        let data = zone_mut(&mut zones, zone)?;
        data.pruned_upto = data.seq;
        data.journal.clear();
        Ok(())
    }

    fn check_write(
        data: &ZoneData,
        op: &WriteOp,
    ) -> std::result::Result<(), SaveConflict> {
        let existing = data.records.get(op.name());
        match op {
            WriteOp::Upsert(record) => match (existing, record.base_etag) {
                (None, None) => Ok(()),
                (None, Some(_)) => Err(SaveConflict {
                    name: record.name.clone(),
                    current_etag: None,
                    reason: "record no longer exists".into(),
                }),
                (Some(current), base) => {
                    if base != Some(current.etag) {
                        return Err(SaveConflict {
                            name: record.name.clone(),
                            current_etag: Some(current.etag),
                            reason: "etag mismatch".into(),
                        });
                    }
                    // Circles additionally never move backwards, whatever
                    // the caller based its write on. Equal generation is
                    // allowed only when trust is unchanged (applicant
                    // updates carry no generation bump).
                    if let (SyncedRecord::Circle(new), SyncedRecord::Circle(stored)) =
                        (&record.body, &current.body)
                    {
                        let applicant_update = new.generation == stored.generation
                            && new.members == stored.members
                            && new.retirees == stored.retirees;
                        if new.generation < stored.generation
                            || (new.generation == stored.generation && !applicant_update)
                        {
                            return Err(SaveConflict {
                                name: record.name.clone(),
                                current_etag: Some(current.etag),
                                reason: format!(
                                    "circle generation {} does not supersede {}",
                                    new.generation, stored.generation
                                ),
                            });
                        }
                    }
                    Ok(())
                }
            },
            WriteOp::Delete { name, base_etag } => match existing {
                None => Err(SaveConflict {
                    name: name.clone(),
                    current_etag: None,
                    reason: "record no longer exists".into(),
                }),
                Some(current) if current.etag != *base_etag => Err(SaveConflict {
                    name: name.clone(),
                    current_etag: Some(current.etag),
                    reason: "etag mismatch".into(),
                }),
                Some(_) => Ok(()),
            },
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_zone(&self, zone: &ZoneId) -> Result<()> {
        let mut zones = self.zones.write().await;
        zones.entry(zone.clone()).or_insert_with(ZoneData::new);
        Ok(())
    }

    async fn fetch(&self, zone: &ZoneId, since: Option<ChangeToken>) -> Result<FetchOutcome> {
        let zones = self.zones.read().await;
        let data = zone_ref(&zones, zone)?;

        let since = match since {
            None => {
                // Full fetch: the entire current record set.
                let upserts = data
                    .records
                    .iter()
                    .map(|(name, v)| StoredRecord {
                        zone: zone.clone(),
                        name: name.clone(),
                        body: v.body.clone(),
                        base_etag: Some(v.etag),
                    })
                    .collect();
                return Ok(FetchOutcome::Changes(ChangeSet {
                    zone: zone.clone(),
                    upserts,
                    deletes: Vec::new(),
                    token: ChangeToken(data.seq),
                }));
            }
            Some(token) => token,
        };

        if since.0 < data.pruned_upto {
            debug!(%zone, %since, pruned_upto = data.pruned_upto, "change token expired");
            return Ok(FetchOutcome::TokenExpired);
        }

        // Compact the journal window by name; the last change wins.
        let mut latest: BTreeMap<&str, &JournalChange> = BTreeMap::new();
        for entry in data.journal.iter().filter(|e| e.seq > since.0) {
            latest.insert(&entry.name, &entry.change);
        }

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (name, change) in latest {
            match change {
                JournalChange::Upsert => {
                    if let Some(v) = data.records.get(name) {
                        upserts.push(StoredRecord {
                            zone: zone.clone(),
                            name: name.to_string(),
                            body: v.body.clone(),
                            base_etag: Some(v.etag),
                        });
                    }
                }
                JournalChange::Delete => deletes.push(name.to_string()),
            }
        }

        Ok(FetchOutcome::Changes(ChangeSet {
            zone: zone.clone(),
            upserts,
            deletes,
            token: ChangeToken(data.seq),
        }))
    }

    async fn save(&self, zone: &ZoneId, writes: Vec<WriteOp>) -> Result<SaveOutcome> {
        let mut zones = self.zones.write().await;
        let data = zone_mut(&mut zones, zone)?;

        let mut outcome = SaveOutcome::default();
        for op in writes {
            if let Err(conflict) = Self::check_write(data, &op) {
                outcome.conflicts.push(conflict);
                continue;
            }
            data.seq += 1;
            match op {
                WriteOp::Upsert(record) => {
                    let etag = record.body.content_etag()?;
                    data.journal.push_back(JournalEntry {
                        seq: data.seq,
                        name: record.name.clone(),
                        change: JournalChange::Upsert,
                    });
                    data.records.insert(
                        record.name.clone(),
                        Versioned {
                            body: record.body,
                            etag,
                        },
                    );
                    outcome.accepted.push((record.name, etag));
                }
                WriteOp::Delete { name, .. } => {
                    data.journal.push_back(JournalEntry {
                        seq: data.seq,
                        name: name.clone(),
                        change: JournalChange::Delete,
                    });
                    let removed = data
                        .records
                        .remove(&name)
                        .map(|v| v.etag)
                        .unwrap_or(Hash32::ZERO);
                    outcome.accepted.push((name, removed));
                }
            }
            while data.journal.len() > self.history_horizon {
                if let Some(dropped) = data.journal.pop_front() {
                    data.pruned_upto = dropped.seq;
                }
            }
        }

        if !outcome.accepted.is_empty() {
            // Receivers may have gone away; that is not an error.
            let _ = data.notify.send(zone.clone());
        }
        Ok(outcome)
    }

    async fn subscribe(&self, zone: &ZoneId) -> Result<broadcast::Receiver<ZoneId>> {
        let zones = self.zones.read().await;
        Ok(zone_ref(&zones, zone)?.notify.subscribe())
    }
}

fn zone_ref<'a>(zones: &'a HashMap<ZoneId, ZoneData>, zone: &ZoneId) -> Result<&'a ZoneData> {
    zones
        .get(zone)
        .ok_or_else(|| OrbitError::not_found(format!("{zone} does not exist")))
}

fn zone_mut<'a>(
    zones: &'a mut HashMap<ZoneId, ZoneData>,
    zone: &ZoneId,
) -> Result<&'a mut ZoneData> {
    zones
        .get_mut(zone)
        .ok_or_else(|| OrbitError::not_found(format!("{zone} does not exist")))
}
