//! The zone actor.
//!
//! One tokio task per zone owns that zone's [`ZoneState`]; commands arrive
//! over an `mpsc` channel and replies go back over `oneshot`s, so no two
//! operations on the same zone's circle/share/manifest triple ever run
//! concurrently. Different zones run fully in parallel. The only
//! suspension points are record store calls, which race a shutdown signal
//! so an in-flight sync can be cancelled without committing partial state.

use crate::backoff::{with_retry, Backoff};
use crate::config::EngineConfig;
use crate::zone_state::{ApplyOutcome, PendingWrite, ZonePhase, ZoneState};
use orbit_core::{OrbitError, PeerId, RecordId, Result, ZoneId};
use orbit_crypto::KeyVault;
use orbit_store::{
    ChangeSet, DeviceSnapshot, FetchOutcome, RecordStore, StateStore,
};
use orbit_trust::{ApplicationTicket, Circle, CircleStanding, PeerIdentity};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Everything a zone actor needs from its environment.
pub struct ZoneDeps {
    /// The cloud record store.
    pub store: Arc<dyn RecordStore>,
    /// Durable local state.
    pub state_store: Arc<dyn StateStore>,
    /// This device's key vault.
    pub vault: Arc<dyn KeyVault>,
    /// This device's identity.
    pub identity: PeerIdentity,
    /// Engine tunables.
    pub config: EngineConfig,
}

/// Observable status of one zone.
#[derive(Debug, Clone)]
pub struct ZoneStatus {
    /// The zone.
    pub zone: ZoneId,
    /// Current reconciliation phase.
    pub phase: ZonePhase,
    /// This device's standing in the zone's circle.
    pub standing: CircleStanding,
    /// Last accepted circle generation.
    pub generation: Option<u64>,
    /// Records held locally.
    pub record_count: usize,
    /// True when the last push gave up and an explicit `sync_now` is
    /// needed. Status always reflects last-known-good state; a stall is a
    /// flag, never data loss.
    pub stalled: bool,
}

pub(crate) enum ZoneCommand {
    SyncNow {
        reply: oneshot::Sender<Result<()>>,
    },
    PutSecret {
        plaintext: Vec<u8>,
        reply: oneshot::Sender<Result<RecordId>>,
    },
    GetSecret {
        record_id: RecordId,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Status {
        reply: oneshot::Sender<ZoneStatus>,
    },
    JoinCircle {
        reply: oneshot::Sender<Result<CircleStanding>>,
    },
    LeaveCircle {
        reply: oneshot::Sender<Result<()>>,
    },
    AcceptApplicants {
        candidates: Vec<PeerId>,
        reply: oneshot::Sender<Result<()>>,
    },
    AcceptApplication {
        ticket: Box<ApplicationTicket>,
        reply: oneshot::Sender<Result<()>>,
    },
    InstallCircle {
        circle: Box<Circle>,
        reply: oneshot::Sender<Result<()>>,
    },
    CurrentCircle {
        reply: oneshot::Sender<Result<Option<Circle>>>,
    },
}

/// Handle to a running zone actor.
#[derive(Clone)]
pub struct ZoneHandle {
    zone: ZoneId,
    tx: mpsc::Sender<ZoneCommand>,
}

impl ZoneHandle {
    /// The zone this handle addresses.
    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ZoneCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| OrbitError::invalid(format!("{} actor is shut down", self.zone)))?;
        rx.await
            .map_err(|_| OrbitError::invalid(format!("{} actor dropped a reply", self.zone)))?
    }

    /// Run a full fetch/reconcile/push cycle now.
    pub async fn sync_now(&self) -> Result<()> {
        self.request(|reply| ZoneCommand::SyncNow { reply }).await
    }

    /// Store a secret; returns its stable record id immediately.
    pub async fn put_secret(&self, plaintext: Vec<u8>) -> Result<RecordId> {
        self.request(|reply| ZoneCommand::PutSecret { plaintext, reply })
            .await
    }

    /// Fetch and decrypt a secret.
    pub async fn get_secret(&self, record_id: RecordId) -> Result<Vec<u8>> {
        self.request(|reply| ZoneCommand::GetSecret { record_id, reply })
            .await
    }

    /// Observe the zone's status.
    pub async fn status(&self) -> Result<ZoneStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ZoneCommand::Status { reply: tx })
            .await
            .map_err(|_| OrbitError::invalid(format!("{} actor is shut down", self.zone)))?;
        rx.await
            .map_err(|_| OrbitError::invalid(format!("{} actor dropped a reply", self.zone)))
    }

    /// Found or apply to the zone's circle.
    pub async fn join_circle(&self) -> Result<CircleStanding> {
        self.request(|reply| ZoneCommand::JoinCircle { reply }).await
    }

    /// Retire from the zone's circle.
    pub async fn leave_circle(&self) -> Result<()> {
        self.request(|reply| ZoneCommand::LeaveCircle { reply })
            .await
    }

    /// Accept pending applicants (member only).
    pub async fn accept_applicants(&self, candidates: Vec<PeerId>) -> Result<()> {
        self.request(|reply| ZoneCommand::AcceptApplicants { candidates, reply })
            .await
    }

    /// Admit and accept an application ticket that arrived out of band
    /// (the pairing channel), in one circle write.
    pub async fn accept_application(&self, ticket: ApplicationTicket) -> Result<()> {
        self.request(|reply| ZoneCommand::AcceptApplication {
            ticket: Box::new(ticket),
            reply,
        })
        .await
    }

    /// Install a circle produced out of band (the pairing channel),
    /// subject to the same validation and store CAS as any other write.
    pub async fn install_circle(&self, circle: Circle) -> Result<()> {
        self.request(|reply| ZoneCommand::InstallCircle {
            circle: Box::new(circle),
            reply,
        })
        .await
    }

    /// The zone's last accepted circle.
    pub async fn current_circle(&self) -> Result<Option<Circle>> {
        self.request(|reply| ZoneCommand::CurrentCircle { reply })
            .await
    }
}

/// The zone actor: state plus environment, driven by a command loop.
pub struct ZoneActor {
    state: ZoneState,
    deps: ZoneDeps,
    rng: StdRng,
}

impl ZoneActor {
    /// Spawn an actor for `zone`, restoring persisted state.
    pub async fn spawn(
        zone: ZoneId,
        deps: ZoneDeps,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ZoneHandle> {
        Self::spawn_with_rng(zone, deps, shutdown, StdRng::from_entropy()).await
    }

    /// Spawn with a caller-supplied RNG (deterministic in tests).
    pub async fn spawn_with_rng(
        zone: ZoneId,
        deps: ZoneDeps,
        shutdown: watch::Receiver<bool>,
        rng: StdRng,
    ) -> Result<ZoneHandle> {
        let snapshot = deps.state_store.load_zone(&zone).await?;
        let circle = deps
            .state_store
            .load_device()
            .await?
            .and_then(|device| device.circle);
        let state = ZoneState::from_snapshot(zone.clone(), snapshot, circle);

        let (tx, rx) = mpsc::channel(deps.config.command_queue_depth);
        let actor = Self { state, deps, rng };
        tokio::spawn(actor.run(rx, shutdown));
        Ok(ZoneHandle { zone, tx })
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ZoneCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(zone = %self.state.zone, "zone actor shutting down");
                    break;
                }
                command = rx.recv() => match command {
                    Some(command) => self.handle(command, &mut shutdown).await,
                    None => break,
                },
            }
        }
    }

    async fn handle(&mut self, command: ZoneCommand, shutdown: &mut watch::Receiver<bool>) {
        match command {
            ZoneCommand::SyncNow { reply } => {
                let result = self.sync(shutdown).await;
                let _ = reply.send(result);
            }
            ZoneCommand::PutSecret { plaintext, reply } => {
                let result = self.state.put_secret(plaintext, &mut self.rng);
                let _ = reply.send(result);
            }
            ZoneCommand::GetSecret { record_id, reply } => {
                // Missing records may simply not have synced yet; try one
                // cycle before giving up.
                let mut result = self.state.get_secret(&record_id);
                if matches!(result, Err(OrbitError::NotFound { .. })) {
                    if let Err(error) = self.sync(shutdown).await {
                        warn!(zone = %self.state.zone, %error, "sync during get failed");
                    }
                    result = self.state.get_secret(&record_id);
                }
                let _ = reply.send(result);
            }
            ZoneCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ZoneCommand::JoinCircle { reply } => {
                let result = self.join(shutdown).await;
                let _ = reply.send(result);
            }
            ZoneCommand::LeaveCircle { reply } => {
                let result = self.leave(shutdown).await;
                let _ = reply.send(result);
            }
            ZoneCommand::AcceptApplicants { candidates, reply } => {
                let result = self.accept(candidates, shutdown).await;
                let _ = reply.send(result);
            }
            ZoneCommand::AcceptApplication { ticket, reply } => {
                let result = self.accept_application(*ticket, shutdown).await;
                let _ = reply.send(result);
            }
            ZoneCommand::InstallCircle { circle, reply } => {
                let result = self.install_circle(*circle, shutdown).await;
                let _ = reply.send(result);
            }
            ZoneCommand::CurrentCircle { reply } => {
                let _ = reply.send(Ok(self.state.circle.clone()));
            }
        }
    }

    fn status(&self) -> ZoneStatus {
        ZoneStatus {
            zone: self.state.zone.clone(),
            phase: self.state.phase,
            standing: self.state.standing_of(&self.deps.vault.peer_id()),
            generation: self.state.circle.as_ref().map(|c| c.generation),
            record_count: self.state.records.len(),
            stalled: self.state.stalled,
        }
    }

    /// One full reconciliation cycle:
    /// `Idle → Fetching → Reconciling → {Idle, Error, ReKeying}`.
    async fn sync(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.state.phase = ZonePhase::Fetching;
        let (set, full) = match self.fetch_changes(shutdown).await {
            Ok(fetched) => fetched,
            Err(error) => {
                self.state.phase = ZonePhase::Error;
                return Err(error);
            }
        };

        self.state.phase = ZonePhase::Reconciling;
        let outcome = match self.state.apply_change_set(&set, full) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.state.phase = ZonePhase::Error;
                return Err(error);
            }
        };

        if let Err(error) = self.after_apply(&outcome) {
            self.state.phase = ZonePhase::Error;
            return Err(error);
        }

        if let Err(error) = self.push_pending(shutdown).await {
            self.state.phase = ZonePhase::Error;
            self.persist().await;
            return Err(error);
        }

        self.state.phase = ZonePhase::Idle;
        self.state.stalled = false;
        self.persist().await;
        Ok(())
    }

    /// Key management after a change set lands: recover or mint the zone
    /// key, re-key on membership removal, cover new members, and queue an
    /// updated manifest.
    fn after_apply(&mut self, outcome: &ApplyOutcome) -> Result<()> {
        let vault = Arc::clone(&self.deps.vault);
        if let Err(error) = self.state.ensure_zone_key(vault.as_ref(), &mut self.rng) {
            // A poisoned or missing share means we wait for a fresh one;
            // integrity failures here never abort the sync.
            warn!(zone = %self.state.zone, %error, "zone key not usable yet");
        }

        let own_id = vault.peer_id();
        let is_member = self
            .state
            .circle
            .as_ref()
            .is_some_and(|c| c.is_member(&own_id));
        if !outcome.removed_members.is_empty()
            && is_member
            && self.state.writing_key().is_some()
        {
            self.state.phase = ZonePhase::ReKeying;
            self.state.rekey(vault.as_ref(), &mut self.rng)?;
        }

        if is_member {
            self.state
                .ensure_member_shares(vault.as_ref(), &mut self.rng)?;
            self.state.queue_manifest(vault.as_ref())?;
        }
        Ok(())
    }

    /// Fetch with retry/backoff; a pruned change token falls back to a
    /// full refetch instead of an incremental one.
    async fn fetch_changes(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(ChangeSet, bool)> {
        let store = Arc::clone(&self.deps.store);
        let zone = self.state.zone.clone();
        let config = &self.deps.config;
        let since = self.state.last_token;

        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        let outcome = cancellable(
            shutdown,
            with_retry(config.max_fetch_attempts, backoff, || {
                let store = Arc::clone(&store);
                let zone = zone.clone();
                async move { store.fetch(&zone, since).await }
            }),
        )
        .await?;

        match outcome {
            FetchOutcome::Changes(set) => Ok((set, since.is_none())),
            FetchOutcome::TokenExpired => {
                debug!(zone = %zone, "change token expired; full refetch");
                let backoff = Backoff::new(config.backoff_base, config.backoff_max);
                let outcome = cancellable(
                    shutdown,
                    with_retry(config.max_fetch_attempts, backoff, || {
                        let store = Arc::clone(&store);
                        let zone = zone.clone();
                        async move { store.fetch(&zone, None).await }
                    }),
                )
                .await?;
                match outcome {
                    FetchOutcome::Changes(set) => Ok((set, true)),
                    FetchOutcome::TokenExpired => Err(OrbitError::network(
                        "store expired a full fetch; giving up this attempt",
                    )),
                }
            }
        }
    }

    /// Push pending writes; on conflict, re-fetch, rebase, and retry up
    /// to the configured bound, then surface `SyncStalled`.
    async fn push_pending(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let mut backoff = Backoff::new(
            self.deps.config.backoff_base,
            self.deps.config.backoff_max,
        );
        for _attempt in 0..self.deps.config.max_push_attempts.max(1) {
            let ops = self.state.build_write_ops();
            if ops.is_empty() {
                return Ok(());
            }

            let store = Arc::clone(&self.deps.store);
            let zone = self.state.zone.clone();
            let outcome = cancellable(shutdown, async move { store.save(&zone, ops).await })
                .await?;
            self.state.mark_pushed(&outcome.accepted);
            if outcome.fully_accepted() {
                return Ok(());
            }

            debug!(zone = %self.state.zone, conflicts = outcome.conflicts.len(),
                "push conflicted; rebasing");
            let (set, full) = self.fetch_changes(shutdown).await?;
            self.state.apply_change_set(&set, full)?;
            self.state.rebase_pending();
            let vault = Arc::clone(&self.deps.vault);
            self.state.queue_manifest(vault.as_ref())?;
            tokio::time::sleep(backoff.next_delay()).await;
        }

        self.state.stalled = true;
        Err(OrbitError::sync_stalled(format!(
            "{} push retries exhausted",
            self.state.zone
        )))
    }

    /// Found or apply to the circle, retrying the intent on CAS losses.
    async fn join(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<CircleStanding> {
        self.deps.store.create_zone(&self.state.zone).await?;
        let vault = Arc::clone(&self.deps.vault);
        let own_id = vault.peer_id();

        for _attempt in 0..self.deps.config.max_push_attempts.max(1) {
            self.sync(shutdown).await?;
            match self.state.standing_of(&own_id) {
                CircleStanding::Member => return Ok(CircleStanding::Member),
                CircleStanding::Applying => return Ok(CircleStanding::Applying),
                CircleStanding::Retired => {
                    return Err(OrbitError::not_authorized(
                        "retired devices cannot rejoin without a reset",
                    ))
                }
                CircleStanding::NoCircle | CircleStanding::Rejected => {}
            }

            let next = match &self.state.circle {
                None => Circle::found(&self.deps.identity, vault.as_ref())?,
                Some(circle) => {
                    let ticket =
                        ApplicationTicket::issue(&self.deps.identity, vault.as_ref())?;
                    circle.with_applicant(ticket)?
                }
            };
            self.state.pending_writes.push(PendingWrite::Circle(next));
            match self.push_pending(shutdown).await {
                Ok(()) => {
                    // Pick up our own write, or whatever won the race.
                    self.sync(shutdown).await?;
                    match self.state.standing_of(&own_id) {
                        standing @ (CircleStanding::Member | CircleStanding::Applying) => {
                            self.persist().await;
                            return Ok(standing);
                        }
                        _ => continue,
                    }
                }
                Err(error) if error.is_terminal() => continue,
                Err(error) => return Err(error),
            }
        }
        Err(OrbitError::sync_stalled(format!(
            "{} join retries exhausted",
            self.state.zone
        )))
    }

    /// Retire from the circle.
    async fn leave(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let vault = Arc::clone(&self.deps.vault);
        for _attempt in 0..self.deps.config.max_push_attempts.max(1) {
            self.sync(shutdown).await?;
            let circle = self
                .state
                .circle
                .clone()
                .ok_or_else(|| OrbitError::invalid("no circle to leave"))?;
            if !circle.is_member(&vault.peer_id()) {
                return Ok(());
            }

            let (next, _ticket) = circle.remove_self(vault.as_ref())?;
            self.state.pending_writes.push(PendingWrite::Circle(next));
            match self.push_pending(shutdown).await {
                Ok(()) => {
                    self.sync(shutdown).await?;
                    if !self
                        .state
                        .circle
                        .as_ref()
                        .is_some_and(|c| c.is_member(&vault.peer_id()))
                    {
                        self.persist().await;
                        return Ok(());
                    }
                }
                Err(error) if error.is_terminal() => continue,
                Err(error) => return Err(error),
            }
        }
        Err(OrbitError::sync_stalled(format!(
            "{} leave retries exhausted",
            self.state.zone
        )))
    }

    /// Accept applicants as a member.
    async fn accept(
        &mut self,
        candidates: Vec<PeerId>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let vault = Arc::clone(&self.deps.vault);
        for _attempt in 0..self.deps.config.max_push_attempts.max(1) {
            self.sync(shutdown).await?;
            let circle = self
                .state
                .circle
                .clone()
                .ok_or_else(|| OrbitError::invalid("no circle to accept into"))?;

            // Retry may find the work already done.
            if candidates.iter().all(|c| circle.is_member(c)) {
                return Ok(());
            }
            let next = circle.accept_applicants(&candidates, vault.as_ref())?;
            self.state.pending_writes.push(PendingWrite::Circle(next));
            match self.push_pending(shutdown).await {
                Ok(()) => {
                    // The follow-up sync adopts the accepted circle and,
                    // via `after_apply`, covers the new members with
                    // shares of the current key.
                    self.sync(shutdown).await?;
                    if candidates
                        .iter()
                        .all(|c| self.state.circle.as_ref().is_some_and(|ci| ci.is_member(c)))
                    {
                        self.persist().await;
                        return Ok(());
                    }
                }
                Err(error) if error.is_terminal() => continue,
                Err(error) => return Err(error),
            }
        }
        Err(OrbitError::sync_stalled(format!(
            "{} accept retries exhausted",
            self.state.zone
        )))
    }

    /// Admit an out-of-band application and accept it in one write. This
    /// is the pairing channel's fast path; the resulting circle goes
    /// through the same generation CAS as a store-mediated acceptance.
    async fn accept_application(
        &mut self,
        ticket: ApplicationTicket,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let candidate = ticket.candidate_id();
        let vault = Arc::clone(&self.deps.vault);
        for _attempt in 0..self.deps.config.max_push_attempts.max(1) {
            self.sync(shutdown).await?;
            let circle = self
                .state
                .circle
                .clone()
                .ok_or_else(|| OrbitError::invalid("no circle to accept into"))?;
            if circle.is_member(&candidate) {
                return Ok(());
            }

            let with_applicant = match circle.standing_of(&candidate) {
                CircleStanding::Applying => circle,
                _ => circle.with_applicant(ticket.clone())?,
            };
            let next = with_applicant.accept_applicants(&[candidate], vault.as_ref())?;
            self.state.pending_writes.push(PendingWrite::Circle(next));
            match self.push_pending(shutdown).await {
                Ok(()) => {
                    self.sync(shutdown).await?;
                    if self
                        .state
                        .circle
                        .as_ref()
                        .is_some_and(|c| c.is_member(&candidate))
                    {
                        self.persist().await;
                        return Ok(());
                    }
                }
                Err(error) if error.is_terminal() => continue,
                Err(error) => return Err(error),
            }
        }
        Err(OrbitError::sync_stalled(format!(
            "{} out-of-band accept retries exhausted",
            self.state.zone
        )))
    }

    /// Land a circle that arrived over the pairing channel. Subject to
    /// the same validation and CAS as a fetched circle; the channel is an
    /// accelerator, never a bypass.
    async fn install_circle(
        &mut self,
        circle: Circle,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        circle.verify(self.state.circle.as_ref())?;
        self.state.circle = Some(circle.clone());
        self.state.pending_writes.push(PendingWrite::Circle(circle));
        // A CAS loss here just means the store already has it (or a
        // newer one); the rebase drops our copy and the sync adopts
        // whatever won.
        match self.push_pending(shutdown).await {
            Ok(()) => {}
            Err(error) if error.is_terminal() => {
                debug!(zone = %self.state.zone, %error, "pairing circle lost the store race");
            }
            Err(error) => return Err(error),
        }
        self.sync(shutdown).await?;
        Ok(())
    }

    async fn persist(&mut self) {
        let snapshot = self.state.to_snapshot();
        if let Err(error) = self
            .deps
            .state_store
            .store_zone(&self.state.zone, snapshot)
            .await
        {
            warn!(zone = %self.state.zone, %error, "failed to persist zone snapshot");
        }
        let device = DeviceSnapshot {
            identity: self.deps.identity.clone(),
            circle: self.state.circle.clone(),
        };
        if let Err(error) = self.deps.state_store.store_device(device).await {
            warn!(zone = %self.state.zone, %error, "failed to persist device snapshot");
        }
    }
}

/// Race a future against the shutdown signal. Cancellation abandons the
/// in-flight call; nothing is committed on this path.
async fn cancellable<T>(
    shutdown: &mut watch::Receiver<bool>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = shutdown.changed() => Err(OrbitError::invalid("cancelled by shutdown")),
        result = fut => result,
    }
}
