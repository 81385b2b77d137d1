//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries for a failing store fetch before the sync attempt errors.
    pub max_fetch_attempts: u32,

    /// Push attempts (each preceded by a rebase) before `SyncStalled`.
    pub max_push_attempts: u32,

    /// Base delay for exponential backoff between retries.
    pub backoff_base: Duration,

    /// Ceiling for backoff delays.
    pub backoff_max: Duration,

    /// Depth of each zone actor's command queue.
    pub command_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fetch_attempts: 3,
            max_push_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            command_queue_depth: 64,
        }
    }
}
