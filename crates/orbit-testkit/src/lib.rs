//! # Orbit Testkit
//!
//! Deterministic fixtures for Orbit tests: seeded vaults and identities,
//! prefabricated circles, and whole test devices wired to a shared
//! in-memory record store. Everything is seeded so failures reproduce.

#![forbid(unsafe_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use orbit_core::ZoneId;
use orbit_crypto::SoftwareVault;
use orbit_keys::ZoneKey;
use orbit_store::{MemoryRecordStore, MemoryStateStore, RecordStore, StateStore};
use orbit_sync::{EngineConfig, SyncEngine};
use orbit_trust::{ApplicationTicket, Circle, PeerIdentity};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;
use std::time::Duration;

/// Seeded RNG for reproducible key and nonce material.
pub fn seeded_rng(seed: u64) -> ChaCha20Rng {
    ChaCha20Rng::seed_from_u64(seed)
}

/// Vault derived from a one-byte seed.
pub fn seeded_vault(seed: u8) -> Arc<SoftwareVault> {
    Arc::new(SoftwareVault::from_seed([seed; 32]))
}

/// Identity plus its vault, derived from a one-byte seed.
pub fn seeded_identity(seed: u8, name: &str) -> (PeerIdentity, Arc<SoftwareVault>) {
    let vault = seeded_vault(seed);
    let identity = PeerIdentity::create(
        vec![
            ("name".into(), name.to_string()),
            ("model".into(), "test-device".into()),
        ],
        vault.as_ref(),
    )
    .unwrap();
    (identity, vault)
}

/// A circle of `n` members built by the founder accepting each of the
/// others in turn. Devices are seeded 1..=n.
pub fn circle_of(n: u8) -> (Circle, Vec<(PeerIdentity, Arc<SoftwareVault>)>) {
    assert!(n >= 1, "a circle needs at least a founder");
    let devices: Vec<_> = (1..=n)
        .map(|seed| seeded_identity(seed, &format!("dev-{seed}")))
        .collect();

    let (founder, founder_vault) = &devices[0];
    let mut circle = Circle::found(founder, founder_vault.as_ref()).unwrap();
    for (identity, vault) in &devices[1..] {
        let ticket = ApplicationTicket::issue(identity, vault.as_ref()).unwrap();
        circle = circle
            .with_applicant(ticket)
            .unwrap()
            .accept_applicants(&[identity.peer_id], founder_vault.as_ref())
            .unwrap();
    }
    (circle, devices)
}

/// A fresh zone key for `zone` with deterministic material.
pub fn seeded_zone_key(zone: &ZoneId, version: u32, seed: u64) -> ZoneKey {
    let mut rng = seeded_rng(seed);
    ZoneKey::generate(zone.clone(), version, &mut rng)
}

/// Engine configuration with fast timers, for tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

/// One simulated device: an engine wired to the shared store with its
/// own vault and local state.
pub struct TestDevice {
    /// The device's engine.
    pub engine: SyncEngine,
    /// The device's identity.
    pub identity: PeerIdentity,
    /// The device's vault.
    pub vault: Arc<SoftwareVault>,
    /// The device's durable local state.
    pub state_store: Arc<MemoryStateStore>,
}

impl TestDevice {
    /// Create a device around `store` with a seeded vault.
    pub fn new(seed: u8, store: &Arc<MemoryRecordStore>) -> Self {
        let vault = seeded_vault(seed);
        let state_store = Arc::new(MemoryStateStore::new());
        let engine = SyncEngine::new(
            Arc::clone(store) as Arc<dyn RecordStore>,
            Arc::clone(&state_store) as Arc<dyn StateStore>,
            vault.clone(),
            vec![
                ("name".into(), format!("dev-{seed}")),
                ("model".into(), "test-device".into()),
            ],
            fast_config(),
        )
        .unwrap();
        let identity = engine.identity().clone();
        Self {
            engine,
            identity,
            vault,
            state_store,
        }
    }
}

/// A shared store plus a set of devices around it.
pub struct TestCluster {
    /// The shared record store.
    pub store: Arc<MemoryRecordStore>,
    /// The devices, in seed order.
    pub devices: Vec<TestDevice>,
}

impl TestCluster {
    /// Create `n` devices (seeds 1..=n) around one in-memory store.
    pub fn new(n: u8) -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        let devices = (1..=n).map(|seed| TestDevice::new(seed, &store)).collect();
        Self { store, devices }
    }

    /// The shared zone used by most scenarios.
    pub fn zone() -> ZoneId {
        ZoneId::new("passwords")
    }
}
