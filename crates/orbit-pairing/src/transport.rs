//! The pairing transport seam.
//!
//! Production backs this with a push-notification service; tests use the
//! in-memory hub, optionally lossy so resend paths get exercised.

use async_trait::async_trait;
use orbit_core::{OrbitError, PeerId, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Queue depth for each registered endpoint.
const ENDPOINT_CAPACITY: usize = 256;

/// One-way opaque-bytes transport to a peer.
#[async_trait]
pub trait PairingTransport: Send + Sync {
    /// Hand `bytes` to the transport for delivery to `peer`.
    ///
    /// Returning `Ok` means accepted for delivery, not delivered;
    /// delivery confirmation is the channel's per-fragment ack.
    async fn send(&self, peer: PeerId, bytes: Vec<u8>) -> Result<()>;
}

type Inbox = mpsc::Sender<(PeerId, Vec<u8>)>;

struct HubInner {
    endpoints: Mutex<HashMap<PeerId, Inbox>>,
}

/// In-memory transport hub connecting registered peers.
#[derive(Clone)]
pub struct MemoryTransportHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryTransportHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransportHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a peer, returning its transport handle and inbox.
    pub async fn register(
        &self,
        peer: PeerId,
    ) -> (MemoryTransport, mpsc::Receiver<(PeerId, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel(ENDPOINT_CAPACITY);
        self.inner.endpoints.lock().await.insert(peer, tx);
        (
            MemoryTransport {
                inner: Arc::clone(&self.inner),
                local: peer,
                drop_every: Arc::new(AtomicU64::new(0)),
                counter: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }
}

/// One peer's endpoint on a [`MemoryTransportHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<HubInner>,
    local: PeerId,
    /// When non-zero, silently drop every Nth send.
    drop_every: Arc<AtomicU64>,
    counter: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Drop every `n`th send (0 disables), for resend tests.
    pub fn set_drop_every(&self, n: u64) {
        self.drop_every.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl PairingTransport for MemoryTransport {
    async fn send(&self, peer: PeerId, bytes: Vec<u8>) -> Result<()> {
        let drop_every = self.drop_every.load(Ordering::SeqCst);
        if drop_every != 0 {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n % drop_every == 0 {
                return Ok(()); // Lost in transit; the channel will resend.
            }
        }
        let endpoints = self.inner.endpoints.lock().await;
        let inbox = endpoints
            .get(&peer)
            .ok_or_else(|| OrbitError::network(format!("{peer} is not reachable")))?;
        inbox
            .send((self.local, bytes))
            .await
            .map_err(|_| OrbitError::network(format!("{peer} closed its inbox")))
    }
}
