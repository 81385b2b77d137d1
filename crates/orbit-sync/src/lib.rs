//! # Orbit Sync
//!
//! The reconciliation engine: one serialized actor per zone applies
//! record-store change sets to local state transactionally, pushes local
//! writes with rebase-and-retry on conflicts, and drives zone re-keying
//! when circle membership shrinks.
//!
//! ## Architecture
//!
//! - [`ZoneState`](zone_state::ZoneState) holds everything a zone owns and
//!   implements every transition synchronously.
//! - [`ZoneActor`](actor::ZoneActor) is the async shell: command loop,
//!   store I/O, retries, cancellation.
//! - [`SyncEngine`](engine::SyncEngine) is the device-level facade:
//!   `join_circle`, `leave_circle`, `circle_status`, `sync_now`,
//!   `put_secret`, `get_secret`.

#![forbid(unsafe_code)]

pub mod actor;
pub mod backoff;
pub mod config;
pub mod engine;
pub mod zone_state;

pub use actor::{ZoneActor, ZoneDeps, ZoneHandle, ZoneStatus};
pub use backoff::Backoff;
pub use config::EngineConfig;
pub use engine::{CircleStatus, SyncEngine};
pub use zone_state::{ApplyOutcome, PendingWrite, ZonePhase, ZoneState};
