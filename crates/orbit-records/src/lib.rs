//! # Orbit Records
//!
//! The encrypted record format and the signed manifest that makes a
//! zone's record set checkable: a [`ZoneManifest`] digests the uuid-sorted
//! record set so two peers holding the same records always produce
//! byte-identical manifests, and missing/extra/corrupted records surface
//! as a digest mismatch or a non-empty [`diff`].

#![forbid(unsafe_code)]

pub mod manifest;
pub mod record;

pub use manifest::{diff, ManifestDiff, PendingManifest, ZoneManifest};
pub use record::SecretRecord;
