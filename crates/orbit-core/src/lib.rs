//! # Orbit Core
//!
//! Foundation types for the Orbit secret synchronization engine:
//!
//! - Identifier newtypes used across every layer (peers, zones, records)
//! - The unified [`OrbitError`] type and its propagation classifiers
//! - A single-chokepoint content hash ([`hash`])
//! - Canonical byte encoding for everything that gets signed ([`canon`])
//! - Wire serialization helpers ([`wire`])
//!
//! Nothing in this crate performs I/O or holds secret key material; it is
//! the dependency root of the workspace.

#![forbid(unsafe_code)]

pub mod canon;
pub mod errors;
pub mod hash;
pub mod identifiers;
pub mod wire;

pub use canon::{Canon, Canonical, ExtraFields};
pub use errors::{OrbitError, Result};
pub use hash::{hash, hasher, Hash32};
pub use identifiers::{ExchangeId, PeerId, RecordId, ZoneId};
pub use wire::{from_slice, to_vec, WIRE_SCHEMA_VERSION};
