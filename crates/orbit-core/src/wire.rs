//! Wire serialization helpers.
//!
//! All synced structures cross process boundaries as bincode behind these
//! two helpers, so the codec is chosen in one place.

use crate::errors::{OrbitError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Wire schema version for persisted and transmitted envelopes.
pub const WIRE_SCHEMA_VERSION: u16 = 1;

/// Serialize a value to wire bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| OrbitError::serialization(e.to_string()))
}

/// Deserialize a value from wire bytes.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| OrbitError::serialization(e.to_string()))
}
