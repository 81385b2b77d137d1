//! Fragmentation and reassembly.
//!
//! Large pairing payloads are split into bounded-size chunks with a
//! sequence number and reassembled under a per-exchange deadline.
//! Duplicate and out-of-order fragments are deduplicated by
//! (exchange, sequence).

use orbit_core::{ExchangeId, OrbitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::warn;

/// Default upper bound on one fragment's payload bytes.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1024;

/// One chunk of a fragmented payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// The exchange this fragment belongs to.
    pub exchange: ExchangeId,
    /// Position in the payload, starting at 0.
    pub seq: u32,
    /// Total fragments in the payload.
    pub total: u32,
    /// This chunk's bytes.
    pub payload: Vec<u8>,
}

/// Wire messages on the pairing transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingMessage {
    /// A payload chunk.
    Fragment(Fragment),
    /// Receipt confirmation for one chunk.
    Ack {
        /// The acknowledged exchange.
        exchange: ExchangeId,
        /// The acknowledged sequence number.
        seq: u32,
    },
}

/// Split `payload` into fragments of at most `max_payload` bytes.
pub fn fragment_payload(
    exchange: ExchangeId,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<Fragment>> {
    if max_payload == 0 {
        return Err(OrbitError::invalid("fragment size must be non-zero"));
    }
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(max_payload).collect()
    };
    let total = u32::try_from(chunks.len())
        .map_err(|_| OrbitError::invalid("payload needs too many fragments"))?;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(seq, chunk)| Fragment {
            exchange,
            seq: seq as u32,
            total,
            payload: chunk.to_vec(),
        })
        .collect())
}

struct PartialPayload {
    total: u32,
    parts: BTreeMap<u32, Vec<u8>>,
    started: Instant,
}

/// Reassembles fragments per exchange, with expiry.
pub struct ReassemblyBuffer {
    partials: HashMap<ExchangeId, PartialPayload>,
    ttl: Duration,
}

impl ReassemblyBuffer {
    /// Create a buffer whose partial payloads expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            partials: HashMap::new(),
            ttl,
        }
    }

    /// Insert a fragment; returns the full payload once complete.
    ///
    /// Duplicates are ignored; a fragment disagreeing about the total or
    /// overrunning it is rejected.
    pub fn insert(&mut self, fragment: Fragment) -> Result<Option<Vec<u8>>> {
        if fragment.seq >= fragment.total {
            return Err(OrbitError::invalid(format!(
                "fragment {}/{} out of range",
                fragment.seq, fragment.total
            )));
        }
        let partial = self
            .partials
            .entry(fragment.exchange)
            .or_insert_with(|| PartialPayload {
                total: fragment.total,
                parts: BTreeMap::new(),
                started: Instant::now(),
            });
        if partial.total != fragment.total {
            return Err(OrbitError::invalid(format!(
                "fragment of {} disagrees about total ({} vs {})",
                fragment.exchange, fragment.total, partial.total
            )));
        }
        // Duplicate fragments are expected under resend; keep the first.
        partial.parts.entry(fragment.seq).or_insert(fragment.payload);

        if partial.parts.len() == partial.total as usize {
            let Some(done) = self.partials.remove(&fragment.exchange) else {
                return Ok(None);
            };
            let mut payload = Vec::new();
            for (_seq, mut chunk) in done.parts {
                payload.append(&mut chunk);
            }
            return Ok(Some(payload));
        }
        Ok(None)
    }

    /// Drop partial payloads older than the TTL, returning their
    /// exchanges.
    pub fn expire(&mut self) -> Vec<ExchangeId> {
        let ttl = self.ttl;
        let expired: Vec<ExchangeId> = self
            .partials
            .iter()
            .filter(|(_, p)| p.started.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            warn!(exchange = %id, "reassembly timed out");
            self.partials.remove(id);
        }
        expired
    }

    /// Number of incomplete payloads held.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
