//! # Orbit Store
//!
//! The seam to the untrusted, eventually-consistent cloud record store,
//! plus the deterministic in-memory implementation used by tests and the
//! simulator path.
//!
//! Everything fetched through this crate is untrusted input: the sync
//! engine validates signatures and manifests before applying anything.
//! The store's job is only durability, change tracking, and the
//! compare-and-swap that arbitrates concurrent writers.

#![forbid(unsafe_code)]

pub mod memory;
pub mod state;
pub mod store;
pub mod types;

pub use memory::MemoryRecordStore;
pub use state::{DeviceSnapshot, MemoryStateStore, StateStore, ZoneSnapshot};
pub use store::{FetchOutcome, RecordStore, SaveConflict, SaveOutcome};
pub use types::{ChangeSet, ChangeToken, StoredRecord, SyncedRecord, WriteOp};
