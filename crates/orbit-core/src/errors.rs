//! Unified error type for Orbit operations.
//!
//! One enum covers the whole taxonomy so that every layer can classify a
//! failure the same way: integrity failures are never recovered locally,
//! transient failures are retried up to fixed bounds, terminal failures are
//! surfaced to the caller.

use serde::{Deserialize, Serialize};

/// Unified error type for all Orbit operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum OrbitError {
    /// Sign/verify/wrap/unwrap failure. Always fatal to the operation.
    #[error("crypto error: {message}")]
    Crypto {
        /// What failed inside the cryptographic operation
        message: String,
    },

    /// A signature did not verify against the claimed signer.
    #[error("signature invalid: {message}")]
    SignatureInvalid {
        /// Which signature failed and over what
        message: String,
    },

    /// A record or share came from a peer outside the trusted set.
    #[error("untrusted sender: {message}")]
    UntrustedSender {
        /// Which sender was rejected
        message: String,
    },

    /// A key share is marked poisoned and must not be used.
    #[error("poisoned key share: {message}")]
    Poisoned {
        /// Which share was poisoned
        message: String,
    },

    /// Ciphertext failed authenticated decryption.
    #[error("decrypt error: {message}")]
    Decrypt {
        /// Which record failed to decrypt
        message: String,
    },

    /// Caller lacks the key material for the requested operation.
    #[error("not authorized: {message}")]
    NotAuthorized {
        /// What the caller attempted
        message: String,
    },

    /// Optimistic-concurrency collision on a store write.
    #[error("version conflict: {message}")]
    VersionConflict {
        /// Which write collided
        message: String,
    },

    /// A circle or manifest arrived with a generation at or below one
    /// already accepted.
    #[error("stale generation: saw {seen}, have {current}")]
    StaleGeneration {
        /// Generation carried by the rejected value
        seen: u64,
        /// Generation already accepted locally
        current: u64,
    },

    /// Transient network or transport failure.
    #[error("network error: {message}")]
    Network {
        /// The underlying transport failure
        message: String,
    },

    /// Sync retries exhausted; requires an explicit `sync_now`.
    #[error("sync stalled: {message}")]
    SyncStalled {
        /// Why the sync gave up
        message: String,
    },

    /// Pairing exchange exceeded its retry ceiling.
    #[error("pairing timed out: {message}")]
    PairingTimedOut {
        /// Which exchange timed out
        message: String,
    },

    /// Serialization or deserialization failure.
    #[error("serialization error: {message}")]
    Serialization {
        /// What failed to (de)serialize
        message: String,
    },

    /// Local storage failure.
    #[error("storage error: {message}")]
    Storage {
        /// The underlying storage failure
        message: String,
    },

    /// Invalid input or a state-machine violation.
    #[error("invalid: {message}")]
    Invalid {
        /// What was invalid
        message: String,
    },

    /// Requested entity does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was not found
        message: String,
    },
}

impl OrbitError {
    /// Create a crypto error.
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a signature-invalid error.
    pub fn signature_invalid(message: impl Into<String>) -> Self {
        Self::SignatureInvalid {
            message: message.into(),
        }
    }

    /// Create an untrusted-sender error.
    pub fn untrusted_sender(message: impl Into<String>) -> Self {
        Self::UntrustedSender {
            message: message.into(),
        }
    }

    /// Create a poisoned-share error.
    pub fn poisoned(message: impl Into<String>) -> Self {
        Self::Poisoned {
            message: message.into(),
        }
    }

    /// Create a decrypt error.
    pub fn decrypt(message: impl Into<String>) -> Self {
        Self::Decrypt {
            message: message.into(),
        }
    }

    /// Create a not-authorized error.
    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::NotAuthorized {
            message: message.into(),
        }
    }

    /// Create a version-conflict error.
    pub fn version_conflict(message: impl Into<String>) -> Self {
        Self::VersionConflict {
            message: message.into(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a sync-stalled error.
    pub fn sync_stalled(message: impl Into<String>) -> Self {
        Self::SyncStalled {
            message: message.into(),
        }
    }

    /// Create a pairing-timed-out error.
    pub fn pairing_timed_out(message: impl Into<String>) -> Self {
        Self::PairingTimedOut {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an invalid-input error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// True for failures that are retried transparently with backoff
    /// (network faults and optimistic-concurrency collisions).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::VersionConflict { .. }
        )
    }

    /// True for integrity failures: the offending record or share is
    /// dropped, never applied, and never recovered locally.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid { .. }
                | Self::UntrustedSender { .. }
                | Self::Poisoned { .. }
                | Self::Decrypt { .. }
                | Self::StaleGeneration { .. }
        )
    }

    /// True for failures surfaced to the caller as a status, requiring an
    /// explicit retry (`sync_now` or a new pairing attempt).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SyncStalled { .. } | Self::PairingTimedOut { .. }
        )
    }
}

/// Standard Result type for Orbit operations.
pub type Result<T> = std::result::Result<T, OrbitError>;

impl From<std::io::Error> for OrbitError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}
