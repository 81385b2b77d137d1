//! Persisted local state seam.
//!
//! What a device remembers between runs: per zone, the accepted and
//! pending manifests, the share log, and the last change token; per
//! device, its identity and circle snapshot. The on-disk format is out of
//! scope; this crate ships the interface and an in-memory implementation.

use crate::types::ChangeToken;
use async_trait::async_trait;
use orbit_core::{Result, ZoneId};
use orbit_keys::ShareLog;
use orbit_records::{PendingManifest, ZoneManifest};
use orbit_trust::{Circle, PeerIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Per-zone persisted state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    /// Latest manifest accepted as authoritative.
    pub current_manifest: Option<ZoneManifest>,
    /// Local knowledge not yet confirmed by the store.
    pub pending_manifest: PendingManifest,
    /// All key shares seen for this zone.
    pub share_log: ShareLog,
    /// Cursor for the next incremental fetch.
    pub last_token: Option<ChangeToken>,
}

/// Per-device persisted state. Private keys stay in the vault; only
/// public state is snapshotted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// This device's identity.
    pub identity: PeerIdentity,
    /// Last known circle.
    pub circle: Option<Circle>,
}

/// Durable local state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a zone's snapshot, or a default when none was saved.
    async fn load_zone(&self, zone: &ZoneId) -> Result<ZoneSnapshot>;

    /// Persist a zone's snapshot.
    async fn store_zone(&self, zone: &ZoneId, snapshot: ZoneSnapshot) -> Result<()>;

    /// Load the device snapshot, if one was saved.
    async fn load_device(&self) -> Result<Option<DeviceSnapshot>>;

    /// Persist the device snapshot.
    async fn store_device(&self, snapshot: DeviceSnapshot) -> Result<()>;
}

/// In-memory [`StateStore`].
#[derive(Default)]
pub struct MemoryStateStore {
    zones: RwLock<HashMap<ZoneId, ZoneSnapshot>>,
    device: RwLock<Option<DeviceSnapshot>>,
}

impl MemoryStateStore {
    /// Create an empty state store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_zone(&self, zone: &ZoneId) -> Result<ZoneSnapshot> {
        Ok(self.zones.read().await.get(zone).cloned().unwrap_or_default())
    }

    async fn store_zone(&self, zone: &ZoneId, snapshot: ZoneSnapshot) -> Result<()> {
        self.zones.write().await.insert(zone.clone(), snapshot);
        Ok(())
    }

    async fn load_device(&self) -> Result<Option<DeviceSnapshot>> {
        Ok(self.device.read().await.clone())
    }

    async fn store_device(&self, snapshot: DeviceSnapshot) -> Result<()> {
        *self.device.write().await = Some(snapshot);
        Ok(())
    }
}
