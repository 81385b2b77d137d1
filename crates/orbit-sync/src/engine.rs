//! The engine facade.
//!
//! One [`SyncEngine`] per device: it owns the key vault, the device
//! identity, and one zone actor per synchronized zone. The circle is
//! logically device-wide; each zone actor maintains its replica through
//! its own zone's record namespace, and the store's compare-and-swap
//! keeps the replicas convergent.

use crate::actor::{ZoneActor, ZoneDeps, ZoneHandle, ZoneStatus};
use crate::config::EngineConfig;
use crate::zone_state::ZonePhase;
use orbit_core::{OrbitError, PeerId, RecordId, Result, ZoneId};
use orbit_crypto::KeyVault;
use orbit_store::{RecordStore, StateStore};
use orbit_trust::{ApplicationTicket, Circle, CircleStanding, PeerIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Caller-facing circle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircleStatus {
    /// This device is not in (or known to) any circle.
    NotInCircle,
    /// Application pending acceptance.
    Applying,
    /// Trusted member.
    Member,
    /// The zone is in a terminal error state; explicit `sync_now` needed.
    Error,
}

/// The multi-device secret synchronization engine.
pub struct SyncEngine {
    store: Arc<dyn RecordStore>,
    state_store: Arc<dyn StateStore>,
    vault: Arc<dyn KeyVault>,
    identity: PeerIdentity,
    config: EngineConfig,
    zones: Mutex<HashMap<ZoneId, ZoneHandle>>,
    shutdown: watch::Sender<bool>,
}

impl SyncEngine {
    /// Create an engine for the device owning `vault`.
    ///
    /// Fails with a crypto error if the device cannot sign its own
    /// identity.
    pub fn new(
        store: Arc<dyn RecordStore>,
        state_store: Arc<dyn StateStore>,
        vault: Arc<dyn KeyVault>,
        device_info: Vec<(String, String)>,
        config: EngineConfig,
    ) -> Result<Self> {
        let identity = PeerIdentity::create(device_info, vault.as_ref())?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            store,
            state_store,
            vault,
            identity,
            config,
            zones: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// This device's identity.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// This device's peer id.
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    /// Handle to a zone's actor, spawning it on first use.
    pub async fn zone(&self, zone: &ZoneId) -> Result<ZoneHandle> {
        let mut zones = self.zones.lock().await;
        if let Some(handle) = zones.get(zone) {
            return Ok(handle.clone());
        }
        let deps = ZoneDeps {
            store: Arc::clone(&self.store),
            state_store: Arc::clone(&self.state_store),
            vault: Arc::clone(&self.vault),
            identity: self.identity.clone(),
            config: self.config.clone(),
        };
        let handle =
            ZoneActor::spawn(zone.clone(), deps, self.shutdown.subscribe()).await?;
        zones.insert(zone.clone(), handle.clone());
        Ok(handle)
    }

    /// Found or apply to a zone's circle.
    pub async fn join_circle(&self, zone: &ZoneId) -> Result<CircleStatus> {
        let standing = self.zone(zone).await?.join_circle().await?;
        Ok(standing_to_status(standing))
    }

    /// Retire from a zone's circle.
    pub async fn leave_circle(&self, zone: &ZoneId) -> Result<()> {
        self.zone(zone).await?.leave_circle().await
    }

    /// The device's standing in a zone's circle.
    ///
    /// Always reflects last-known-good state; a stalled sync shows up as
    /// `Error`, never as data loss.
    pub async fn circle_status(&self, zone: &ZoneId) -> Result<CircleStatus> {
        let status = self.zone(zone).await?.status().await?;
        Ok(status_of(&status))
    }

    /// Full status of a zone, for diagnostics.
    pub async fn zone_status(&self, zone: &ZoneId) -> Result<ZoneStatus> {
        self.zone(zone).await?.status().await
    }

    /// Run a reconciliation cycle now.
    pub async fn sync_now(&self, zone: &ZoneId) -> Result<()> {
        self.zone(zone).await?.sync_now().await
    }

    /// Store a secret in a zone. Returns its stable id immediately; the
    /// write syncs in the background and is never discarded on sync
    /// failure.
    pub async fn put_secret(&self, zone: &ZoneId, plaintext: Vec<u8>) -> Result<RecordId> {
        self.zone(zone).await?.put_secret(plaintext).await
    }

    /// Fetch and decrypt a secret from a zone.
    pub async fn get_secret(&self, zone: &ZoneId, record_id: RecordId) -> Result<Vec<u8>> {
        self.zone(zone).await?.get_secret(record_id).await
    }

    /// Accept pending applicants into a zone's circle (member only).
    pub async fn accept_applicants(
        &self,
        zone: &ZoneId,
        candidates: Vec<PeerId>,
    ) -> Result<()> {
        self.zone(zone).await?.accept_applicants(candidates).await
    }

    /// Admit and accept an application ticket that arrived over the
    /// out-of-band pairing channel (member only).
    pub async fn accept_application(
        &self,
        zone: &ZoneId,
        ticket: ApplicationTicket,
    ) -> Result<()> {
        self.zone(zone).await?.accept_application(ticket).await
    }

    /// Land a circle produced by the out-of-band pairing channel.
    pub async fn install_circle(&self, zone: &ZoneId, circle: Circle) -> Result<()> {
        self.zone(zone).await?.install_circle(circle).await
    }

    /// The last accepted circle for a zone, e.g. to send back over the
    /// pairing channel after an acceptance.
    pub async fn current_circle(&self, zone: &ZoneId) -> Result<Option<Circle>> {
        self.zone(zone).await?.current_circle().await
    }

    /// Signal all zone actors to shut down. In-flight store calls are
    /// abandoned; no partial state is committed.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn standing_to_status(standing: CircleStanding) -> CircleStatus {
    match standing {
        CircleStanding::Member => CircleStatus::Member,
        CircleStanding::Applying => CircleStatus::Applying,
        CircleStanding::NoCircle | CircleStanding::Rejected | CircleStanding::Retired => {
            CircleStatus::NotInCircle
        }
    }
}

fn status_of(status: &ZoneStatus) -> CircleStatus {
    if status.stalled || status.phase == ZonePhase::Error {
        return CircleStatus::Error;
    }
    standing_to_status(status.standing)
}

/// Convenience re-export of the error type for callers holding only this
/// crate.
pub type EngineError = OrbitError;
