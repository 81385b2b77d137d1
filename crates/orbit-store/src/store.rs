//! The record store interface.

use crate::types::{ChangeSet, ChangeToken, WriteOp};
use async_trait::async_trait;
use orbit_core::{Hash32, Result, ZoneId};

/// Result of a fetch: either changes since the given token, or a signal
/// that the token predates the store's retained history and the caller
/// must do a full refetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Changes since the supplied token.
    Changes(ChangeSet),
    /// The supplied token was pruned from history.
    TokenExpired,
}

/// One rejected write from a save call.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveConflict {
    /// The record name that conflicted.
    pub name: String,
    /// The record's current etag, if it still exists.
    pub current_etag: Option<Hash32>,
    /// Human-readable reason, for logs.
    pub reason: String,
}

/// Result of a save: per-record acceptance and conflicts.
///
/// A conflicting write is never partially applied; the caller re-fetches,
/// rebases, and retries.
#[derive(Debug, Clone, Default)]
pub struct SaveOutcome {
    /// Accepted record names with their newly assigned etags.
    pub accepted: Vec<(String, Hash32)>,
    /// Rejected writes.
    pub conflicts: Vec<SaveConflict>,
}

impl SaveOutcome {
    /// True when every submitted write was accepted.
    pub fn fully_accepted(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// The abstract cloud record store.
///
/// Implementations are untrusted: callers validate every fetched record
/// before use. The store provides durability, per-zone change tracking,
/// and compare-and-swap arbitration of concurrent writers.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a zone if it does not exist. Idempotent.
    async fn create_zone(&self, zone: &ZoneId) -> Result<()>;

    /// Fetch changes since `since`, or the full zone state when `None`.
    async fn fetch(&self, zone: &ZoneId, since: Option<ChangeToken>) -> Result<FetchOutcome>;

    /// Submit writes. Conflicting writes are reported, not applied.
    async fn save(&self, zone: &ZoneId, writes: Vec<WriteOp>) -> Result<SaveOutcome>;

    /// Subscribe to change notifications for a zone.
    async fn subscribe(&self, zone: &ZoneId) -> Result<tokio::sync::broadcast::Receiver<ZoneId>>;
}
