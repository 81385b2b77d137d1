//! # Orbit Keys
//!
//! The per-zone key hierarchy: each zone owns a symmetric [`ZoneKey`] that
//! encrypts all of its records and never leaves a device unwrapped. A
//! [`KeyShare`] carries the zone key to one specific trusted peer, sealed
//! to that peer's public encryption key and signed by the sender.
//!
//! Rotation is append-only: a new key and fresh shares are issued at the
//! next epoch, and prior shares are marked superseded (poisoned) rather
//! than deleted, so a revoked peer finds a poisoned share instead of
//! silently finding nothing.

#![forbid(unsafe_code)]

pub mod share;
pub mod share_log;
pub mod zone_key;

pub use share::{recover_zone_key, share_zone_key, KeyShare};
pub use share_log::{LoggedShare, ShareLog};
pub use zone_key::{ZoneKey, ZoneKeyId};
