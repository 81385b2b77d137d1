//! The pairing channel and its exchange state machine.
//!
//! One exchange carries one sealed payload (an application or an
//! acceptance) as acknowledged fragments:
//! `Sent → AckPending → Complete | TimedOut`. Unacknowledged fragments
//! are resent with backoff; past the ceiling the exchange fails with
//! `PairingTimedOut` and the caller falls back to the store-mediated
//! join.

use crate::fragment::{
    fragment_payload, PairingMessage, ReassemblyBuffer, MAX_FRAGMENT_PAYLOAD,
};
use crate::transport::PairingTransport;
use orbit_core::{from_slice, to_vec, ExchangeId, OrbitError, PeerId, Result};
use orbit_crypto::{seal_for_peer, KeyVault, SealedBox};
use orbit_trust::{ApplicationTicket, Circle, PeerIdentity};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// State of one pairing exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Fragments handed to the transport, no ack round completed yet.
    Sent,
    /// Waiting for fragment acknowledgments.
    AckPending,
    /// All fragments acknowledged.
    Complete,
    /// Retry ceiling reached without full acknowledgment.
    TimedOut,
}

/// What travels inside a sealed pairing payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PairingPayload {
    /// A candidate's request to join.
    Application(ApplicationTicket),
    /// The accepted circle, returned to the candidate.
    Acceptance(Box<Circle>),
}

/// Pairing channel tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Upper bound on one fragment's payload bytes.
    pub max_fragment_payload: usize,
    /// How long one ack round waits before resending.
    pub ack_timeout: Duration,
    /// Send rounds before the exchange times out.
    pub max_rounds: u32,
    /// Base delay added between resend rounds.
    pub backoff_base: Duration,
    /// Ceiling for the resend delay.
    pub backoff_max: Duration,
    /// How long incomplete reassemblies are kept.
    pub reassembly_ttl: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            max_fragment_payload: MAX_FRAGMENT_PAYLOAD,
            ack_timeout: Duration::from_millis(250),
            max_rounds: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            reassembly_ttl: Duration::from_secs(30),
        }
    }
}

/// One device's endpoint on the pairing transport.
pub struct PairingChannel {
    transport: Arc<dyn PairingTransport>,
    inbox: mpsc::Receiver<(PeerId, Vec<u8>)>,
    vault: Arc<dyn KeyVault>,
    config: PairingConfig,
    reassembly: ReassemblyBuffer,
    exchanges: HashMap<ExchangeId, ExchangeState>,
    ready: VecDeque<(PeerId, PairingPayload)>,
    rng: StdRng,
}

impl PairingChannel {
    /// Create a channel over `transport`, receiving on `inbox`.
    pub fn new(
        transport: Arc<dyn PairingTransport>,
        inbox: mpsc::Receiver<(PeerId, Vec<u8>)>,
        vault: Arc<dyn KeyVault>,
        config: PairingConfig,
    ) -> Self {
        let reassembly = ReassemblyBuffer::new(config.reassembly_ttl);
        Self {
            transport,
            inbox,
            vault,
            config,
            reassembly,
            exchanges: HashMap::new(),
            ready: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic RNG for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Observed state of an exchange started by this side.
    pub fn exchange_state(&self, exchange: &ExchangeId) -> Option<ExchangeState> {
        self.exchanges.get(exchange).copied()
    }

    /// Seal `payload` to `recipient` and deliver it as acknowledged
    /// fragments. Resolves once every fragment is acked, or fails with
    /// `PairingTimedOut` after the retry ceiling.
    pub async fn send_payload(
        &mut self,
        recipient: &PeerIdentity,
        payload: &PairingPayload,
    ) -> Result<ExchangeId> {
        let exchange = ExchangeId::new();
        let plaintext = to_vec(payload)?;
        let sealed = seal_for_peer(
            &plaintext,
            &recipient.encryption_public,
            &seal_info(&exchange),
            &mut self.rng,
        )?;
        let wire = to_vec(&sealed)?;
        let fragments =
            fragment_payload(exchange, &wire, self.config.max_fragment_payload)?;
        let mut unacked: BTreeSet<u32> = fragments.iter().map(|f| f.seq).collect();

        self.exchanges.insert(exchange, ExchangeState::Sent);
        for round in 0..self.config.max_rounds.max(1) {
            if round > 0 {
                let delay = resend_delay(&self.config, round - 1);
                debug!(%exchange, round, ?delay, pending = unacked.len(),
                    "resending unacknowledged fragments");
                tokio::time::sleep(delay).await;
            }
            for fragment in fragments.iter().filter(|f| unacked.contains(&f.seq)) {
                self.transport
                    .send(recipient.peer_id, to_vec(&PairingMessage::Fragment(fragment.clone()))?)
                    .await?;
            }
            self.exchanges.insert(exchange, ExchangeState::AckPending);

            let deadline = Instant::now() + self.config.ack_timeout;
            while !unacked.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, self.inbox.recv()).await {
                    Ok(Some((from, bytes))) => {
                        self.handle_incoming(from, bytes, Some((&exchange, &mut unacked)))
                            .await;
                    }
                    Ok(None) => {
                        return Err(OrbitError::network("pairing transport closed"))
                    }
                    Err(_) => break, // Ack round timed out; resend.
                }
            }
            if unacked.is_empty() {
                self.exchanges.insert(exchange, ExchangeState::Complete);
                return Ok(exchange);
            }
        }

        self.exchanges.insert(exchange, ExchangeState::TimedOut);
        Err(OrbitError::pairing_timed_out(format!(
            "{exchange} unacknowledged after {} rounds",
            self.config.max_rounds
        )))
    }

    /// Wait for the next complete payload addressed to this device.
    pub async fn recv_payload(
        &mut self,
        wait: Duration,
    ) -> Result<(PeerId, PairingPayload)> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(ready) = self.ready.pop_front() {
                return Ok(ready);
            }
            self.reassembly.expire();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrbitError::pairing_timed_out(
                    "no pairing payload arrived in time",
                ));
            }
            match timeout(remaining, self.inbox.recv()).await {
                Ok(Some((from, bytes))) => {
                    self.handle_incoming(from, bytes, None).await;
                }
                Ok(None) => return Err(OrbitError::network("pairing transport closed")),
                Err(_) => {
                    return Err(OrbitError::pairing_timed_out(
                        "no pairing payload arrived in time",
                    ))
                }
            }
        }
    }

    /// Process one transport datagram: ack our exchange, or ack and
    /// reassemble an incoming fragment. Malformed input is dropped.
    async fn handle_incoming(
        &mut self,
        from: PeerId,
        bytes: Vec<u8>,
        active: Option<(&ExchangeId, &mut BTreeSet<u32>)>,
    ) {
        let message: PairingMessage = match from_slice(&bytes) {
            Ok(message) => message,
            Err(error) => {
                warn!(%from, %error, "dropped malformed pairing datagram");
                return;
            }
        };
        match message {
            PairingMessage::Ack { exchange, seq } => {
                if let Some((active_exchange, unacked)) = active {
                    if exchange == *active_exchange {
                        unacked.remove(&seq);
                    }
                }
                // Acks for finished exchanges are stale; ignore.
            }
            PairingMessage::Fragment(fragment) => {
                let exchange = fragment.exchange;
                let seq = fragment.seq;
                if let Err(error) = self.ack(from, exchange, seq).await {
                    warn!(%from, %error, "failed to ack fragment");
                }
                match self.reassembly.insert(fragment) {
                    Ok(Some(wire)) => self.complete_payload(from, exchange, &wire),
                    Ok(None) => {}
                    Err(error) => {
                        warn!(%from, %error, "dropped inconsistent fragment");
                    }
                }
            }
        }
    }

    fn complete_payload(&mut self, from: PeerId, exchange: ExchangeId, wire: &[u8]) {
        let sealed: SealedBox = match from_slice(wire) {
            Ok(sealed) => sealed,
            Err(error) => {
                warn!(%from, %error, "dropped malformed sealed payload");
                return;
            }
        };
        let plaintext = match self.vault.unseal(&sealed, &seal_info(&exchange)) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(%from, %error, "dropped payload not sealed to this device");
                return;
            }
        };
        match from_slice::<PairingPayload>(&plaintext) {
            Ok(payload) => {
                debug!(%from, %exchange, "pairing payload complete");
                self.ready.push_back((from, payload));
            }
            Err(error) => {
                warn!(%from, %error, "dropped undecodable pairing payload");
            }
        }
    }

    async fn ack(&self, to: PeerId, exchange: ExchangeId, seq: u32) -> Result<()> {
        self.transport
            .send(to, to_vec(&PairingMessage::Ack { exchange, seq })?)
            .await
    }
}

fn seal_info(exchange: &ExchangeId) -> String {
    format!("orbit-pairing:{exchange}")
}

fn resend_delay(config: &PairingConfig, round: u32) -> Duration {
    config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(round.min(16)))
        .min(config.backoff_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransportHub;
    use orbit_crypto::SoftwareVault;

    fn device(seed: u8) -> (PeerIdentity, Arc<SoftwareVault>) {
        let vault = Arc::new(SoftwareVault::from_seed([seed; 32]));
        let identity = PeerIdentity::create(
            vec![("name".into(), format!("dev-{seed}"))],
            vault.as_ref(),
        )
        .unwrap();
        (identity, vault)
    }

    fn test_config() -> PairingConfig {
        PairingConfig {
            ack_timeout: Duration::from_millis(50),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            max_rounds: 4,
            ..PairingConfig::default()
        }
    }

    async fn channel_pair() -> (
        (PeerIdentity, PairingChannel),
        (PeerIdentity, PairingChannel),
    ) {
        let hub = MemoryTransportHub::new();
        let (a_id, a_vault) = device(1);
        let (b_id, b_vault) = device(2);
        let (a_tx, a_rx) = hub.register(a_id.peer_id).await;
        let (b_tx, b_rx) = hub.register(b_id.peer_id).await;
        let a = PairingChannel::new(Arc::new(a_tx), a_rx, a_vault, test_config()).with_seed(1);
        let b = PairingChannel::new(Arc::new(b_tx), b_rx, b_vault, test_config()).with_seed(2);
        ((a_id, a), (b_id, b))
    }

    fn application(identity: &PeerIdentity, seed: u8) -> PairingPayload {
        let vault = SoftwareVault::from_seed([seed; 32]);
        PairingPayload::Application(ApplicationTicket::issue(identity, &vault).unwrap())
    }

    #[tokio::test]
    async fn application_crosses_the_channel() {
        let ((a_id, mut a), (b_id, mut b)) = channel_pair().await;
        let payload = application(&a_id, 1);

        let (send, recv) = tokio::join!(
            a.send_payload(&b_id, &payload),
            b.recv_payload(Duration::from_secs(2)),
        );
        let exchange = send.unwrap();
        assert_eq!(a.exchange_state(&exchange), Some(ExchangeState::Complete));

        let (from, received) = recv.unwrap();
        assert_eq!(from, a_id.peer_id);
        match received {
            PairingPayload::Application(ticket) => {
                ticket.verify(|_| None).unwrap();
                assert_eq!(ticket.candidate_id(), a_id.peer_id);
            }
            PairingPayload::Acceptance(_) => panic!("expected an application"),
        }
    }

    #[tokio::test]
    async fn large_payloads_fragment_and_survive_loss() {
        let hub = MemoryTransportHub::new();
        let (a_id, a_vault) = device(1);
        let (b_id, b_vault) = device(2);
        let (a_tx, a_rx) = hub.register(a_id.peer_id).await;
        let (b_tx, b_rx) = hub.register(b_id.peer_id).await;
        // Tiny fragments plus a lossy sender exercise resend.
        a_tx.set_drop_every(3);
        let config = PairingConfig {
            max_fragment_payload: 64,
            ..test_config()
        };
        let mut a =
            PairingChannel::new(Arc::new(a_tx), a_rx, a_vault, config.clone()).with_seed(3);
        let mut b = PairingChannel::new(Arc::new(b_tx), b_rx, b_vault, config).with_seed(4);

        let payload = application(&a_id, 1);
        let (send, recv) = tokio::join!(
            a.send_payload(&b_id, &payload),
            b.recv_payload(Duration::from_secs(5)),
        );
        send.unwrap();
        let (from, _) = recv.unwrap();
        assert_eq!(from, a_id.peer_id);
    }

    #[tokio::test]
    async fn unreachable_recipient_times_out() {
        let hub = MemoryTransportHub::new();
        let (a_id, a_vault) = device(1);
        let (b_id, _) = device(2);
        let (a_tx, a_rx) = hub.register(a_id.peer_id).await;
        // B never registers; sends are lost at the hub.
        a_tx.set_drop_every(1);
        let mut a =
            PairingChannel::new(Arc::new(a_tx), a_rx, a_vault, test_config()).with_seed(5);

        let payload = application(&a_id, 1);
        let err = a.send_payload(&b_id, &payload).await.unwrap_err();
        assert!(matches!(err, OrbitError::PairingTimedOut { .. }));
    }

    #[tokio::test]
    async fn payload_sealed_to_someone_else_is_dropped() {
        let hub = MemoryTransportHub::new();
        let (a_id, a_vault) = device(1);
        let (b_id, _) = device(2);
        let (c_id, c_vault) = device(3);
        let (a_tx, a_rx) = hub.register(a_id.peer_id).await;
        // C listens under B's... no: C registers itself, and A addresses
        // fragments to C but seals the payload for B.
        let (_c_tx, c_rx) = hub.register(c_id.peer_id).await;
        let mut a =
            PairingChannel::new(Arc::new(a_tx), a_rx, a_vault, test_config()).with_seed(6);

        let mis_sealed = PeerIdentity {
            encryption_public: b_id.encryption_public.clone(),
            ..c_id.clone()
        };
        let hub_c_tx = {
            let (tx, _rx) = hub.register(PeerId::from_signing_key(&[99; 32])).await;
            tx
        };
        let mut c = PairingChannel::new(Arc::new(hub_c_tx), c_rx, c_vault, test_config())
            .with_seed(7);

        let payload = application(&a_id, 1);
        let (send, recv) = tokio::join!(
            a.send_payload(&mis_sealed, &payload),
            c.recv_payload(Duration::from_millis(400)),
        );
        // C acks the fragments (transport-level delivery succeeds)...
        send.unwrap();
        // ...but cannot unseal the payload, so nothing surfaces.
        assert!(matches!(
            recv.unwrap_err(),
            OrbitError::PairingTimedOut { .. }
        ));
    }
}
