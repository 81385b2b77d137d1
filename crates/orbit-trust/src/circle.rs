//! The membership circle.
//!
//! A [`Circle`] is the signed set of trusted peers plus pending applicants
//! and permanent retirees. Members and retirees are covered by the signed
//! image; applicants are not, so a candidate can add its own application
//! without invalidating member signatures. Every membership-changing write
//! produces a successor with a strictly higher generation.

use crate::identity::PeerIdentity;
use crate::tickets::{ApplicationTicket, RetirementTicket};
use orbit_core::{hash, Canon, Canonical, ExtraFields, OrbitError, PeerId, Result};
use orbit_crypto::{verify_signature, KeyVault, Signature, SigningPublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const CIRCLE_DOMAIN: &str = "orbit-circle-v1";

/// A device's standing relative to a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircleStanding {
    /// Not referenced by the circle at all.
    NoCircle,
    /// Application pending acceptance.
    Applying,
    /// Current trusted member.
    Member,
    /// Previously trusted, now retired.
    Retired,
    /// Application was removed without acceptance. Device-local state:
    /// a fetched circle never carries this directly.
    Rejected,
}

/// One member's (or retiree's) signature over the circle image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleSignature {
    /// Who signed.
    pub signer: PeerId,
    /// Signature over the canonical circle image.
    pub signature: Signature,
}

/// The signed membership set of trusted peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    /// Monotonic generation count; strictly increases on every
    /// membership-changing write.
    pub generation: u64,
    /// Current trusted members, keyed by peer id.
    pub members: BTreeMap<PeerId, PeerIdentity>,
    /// Pending applications, keyed by candidate id. Not part of the
    /// signed image.
    pub applicants: BTreeMap<PeerId, ApplicationTicket>,
    /// Retirement tickets, kept forever so revocation stays detectable.
    pub retirees: BTreeMap<PeerId, RetirementTicket>,
    /// Unknown fields carried verbatim inside the signed image.
    pub extra_fields: ExtraFields,
    /// Signatures over the circle image.
    pub signatures: Vec<CircleSignature>,
}

impl Canonical for Circle {
    fn canonical_bytes(&self) -> Vec<u8> {
        // BTreeMap iteration is ordered by peer id, which keeps the image
        // deterministic across devices. Applicants are deliberately
        // excluded; they carry their own candidate signatures.
        Canon::new(CIRCLE_DOMAIN)
            .u64(self.generation)
            .list(
                self.members
                    .values()
                    .map(|m| m.gestalt_hash().as_bytes().to_vec()),
            )
            .list(
                self.retirees
                    .values()
                    .map(|t| hash(&retirement_ticket_bytes(t)).as_bytes().to_vec()),
            )
            .extra(&self.extra_fields)
            .finish()
    }
}

impl Circle {
    /// Found a new circle with `identity` as its only member.
    ///
    /// This is the "reset to offering" of a device that has no circle yet;
    /// the result has generation 1.
    pub fn found(identity: &PeerIdentity, vault: &dyn KeyVault) -> Result<Self> {
        identity.verify()?;
        let circle = Self {
            generation: 1,
            members: BTreeMap::from([(identity.peer_id, identity.clone())]),
            applicants: BTreeMap::new(),
            retirees: BTreeMap::new(),
            extra_fields: Vec::new(),
            signatures: Vec::new(),
        };
        circle.signed_by(vault)
    }

    /// Add a verified application to the applicant set.
    ///
    /// Valid only for candidates with standing `NoCircle` or `Rejected`;
    /// the generation does not change because trust does not change.
    pub fn with_applicant(&self, ticket: ApplicationTicket) -> Result<Self> {
        ticket.verify(|id| self.member_key(id))?;
        let candidate = ticket.candidate_id();
        match self.standing_of(&candidate) {
            CircleStanding::NoCircle | CircleStanding::Rejected => {}
            standing => {
                return Err(OrbitError::invalid(format!(
                    "{candidate} cannot apply while {standing:?}"
                )))
            }
        }
        let mut next = self.clone();
        next.applicants.insert(candidate, ticket);
        Ok(next)
    }

    /// Accept pending applicants, counter-signing their tickets.
    ///
    /// Valid only when `approver` is a current member. Bumps the
    /// generation and re-signs the circle.
    pub fn accept_applicants(
        &self,
        candidates: &[PeerId],
        approver: &dyn KeyVault,
    ) -> Result<Self> {
        if !self.is_member(&approver.peer_id()) {
            return Err(OrbitError::not_authorized(format!(
                "{} is not a member and cannot accept applicants",
                approver.peer_id()
            )));
        }

        let mut next = self.clone();
        next.generation += 1;
        for candidate in candidates {
            let ticket = next.applicants.remove(candidate).ok_or_else(|| {
                OrbitError::not_found(format!("no pending application for {candidate}"))
            })?;
            let approved = ticket.approve(approver)?;
            next.members
                .insert(approved.candidate_id(), approved.candidate.clone());
        }
        next.signatures.clear();
        next.signed_by(approver)
    }

    /// Drop pending applications without changing anyone's trust.
    ///
    /// The generation and existing signatures stay untouched: applicants
    /// are outside the signed image.
    pub fn reject_applicants(&self, candidates: &[PeerId]) -> Result<Self> {
        let mut next = self.clone();
        for candidate in candidates {
            if next.applicants.remove(candidate).is_none() {
                return Err(OrbitError::not_found(format!(
                    "no pending application for {candidate}"
                )));
            }
        }
        Ok(next)
    }

    /// Leave the circle, issuing a retirement ticket for this device.
    ///
    /// The departing peer signs the successor circle itself; the caller
    /// must follow up with a zone re-key so the retiree cannot decrypt
    /// future records.
    pub fn remove_self(&self, vault: &dyn KeyVault) -> Result<(Self, RetirementTicket)> {
        let own_id = vault.peer_id();
        let identity = self
            .members
            .get(&own_id)
            .ok_or_else(|| {
                OrbitError::not_authorized(format!("{own_id} is not a member of this circle"))
            })?
            .clone();

        let ticket = RetirementTicket::issue(&identity, vault)?;
        let mut next = self.clone();
        next.generation += 1;
        next.members.remove(&own_id);
        next.retirees.insert(own_id, ticket.clone());
        next.signatures.clear();
        Ok((next.signed_by(vault)?, ticket))
    }

    /// Destructive recovery: a successor with no members at all.
    ///
    /// Signed by the resetting device, which was a member of the prior
    /// circle; validation resolves the signer against that prior state.
    pub fn reset_to_empty(&self, vault: &dyn KeyVault) -> Result<Self> {
        let next = Self {
            generation: self.generation + 1,
            members: BTreeMap::new(),
            applicants: BTreeMap::new(),
            retirees: self.retirees.clone(),
            extra_fields: Vec::new(),
            signatures: Vec::new(),
        };
        next.signed_by(vault)
    }

    /// Destructive recovery: a successor containing only this device.
    pub fn reset_to_offering(
        &self,
        identity: &PeerIdentity,
        vault: &dyn KeyVault,
    ) -> Result<Self> {
        identity.verify()?;
        if identity.peer_id != vault.peer_id() {
            return Err(OrbitError::not_authorized(
                "reset must be signed by the offered identity's own key",
            ));
        }
        let next = Self {
            generation: self.generation + 1,
            members: BTreeMap::from([(identity.peer_id, identity.clone())]),
            applicants: BTreeMap::new(),
            retirees: self.retirees.clone(),
            extra_fields: Vec::new(),
            signatures: Vec::new(),
        };
        next.signed_by(vault)
    }

    /// Validate this circle, optionally as the successor of `prior`.
    ///
    /// Fails closed: a lower-or-equal generation than `prior`, an invalid
    /// member identity or ticket, or a signature that does not resolve to
    /// a member, retiree, or prior member all reject the circle.
    pub fn verify(&self, prior: Option<&Circle>) -> Result<()> {
        if let Some(prior) = prior {
            // Equal generation is acceptable only for applicant-level
            // updates: trust (members, retirees) must be unchanged.
            let applicant_update = self.generation == prior.generation
                && self.members == prior.members
                && self.retirees == prior.retirees;
            if self.generation < prior.generation
                || (self.generation == prior.generation && !applicant_update)
            {
                return Err(OrbitError::StaleGeneration {
                    seen: self.generation,
                    current: prior.generation,
                });
            }
        }

        for (id, member) in &self.members {
            member.verify()?;
            if *id != member.peer_id {
                return Err(OrbitError::invalid(format!(
                    "member map key {id} does not match identity {}",
                    member.peer_id
                )));
            }
        }
        for ticket in self.applicants.values() {
            ticket.verify(|id| self.member_key(id))?;
        }
        for ticket in self.retirees.values() {
            ticket.verify()?;
        }
        for id in self.retirees.keys() {
            if self.members.contains_key(id) {
                return Err(OrbitError::invalid(format!(
                    "{id} cannot be both member and retiree"
                )));
            }
        }

        if self.signatures.is_empty() {
            return Err(OrbitError::signature_invalid(
                "circle carries no signatures",
            ));
        }
        let image = self.canonical_bytes();
        for sig in &self.signatures {
            let key = self
                .member_key(&sig.signer)
                .or_else(|| self.retiree_key(&sig.signer))
                .or_else(|| prior.and_then(|p| p.member_key(&sig.signer)))
                .ok_or_else(|| {
                    OrbitError::untrusted_sender(format!(
                        "circle signer {} is not resolvable",
                        sig.signer
                    ))
                })?;
            verify_signature(&key, &image, &sig.signature)?;
        }
        Ok(())
    }

    /// A device's standing relative to this circle.
    pub fn standing_of(&self, peer: &PeerId) -> CircleStanding {
        if self.members.contains_key(peer) {
            CircleStanding::Member
        } else if self.applicants.contains_key(peer) {
            CircleStanding::Applying
        } else if self.retirees.contains_key(peer) {
            CircleStanding::Retired
        } else {
            CircleStanding::NoCircle
        }
    }

    /// True when `peer` is a current member.
    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.members.contains_key(peer)
    }

    /// Current member ids, in canonical order.
    pub fn member_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.members.keys()
    }

    /// Resolve a current member's signing key.
    pub fn member_key(&self, peer: &PeerId) -> Option<SigningPublicKey> {
        self.members.get(peer).map(|m| m.signing_public.clone())
    }

    fn retiree_key(&self, peer: &PeerId) -> Option<SigningPublicKey> {
        self.retirees.get(peer).map(|t| t.peer.signing_public.clone())
    }

    fn signed_by(mut self, vault: &dyn KeyVault) -> Result<Self> {
        let signature = vault.sign(&self.canonical_bytes())?;
        self.signatures.push(CircleSignature {
            signer: vault.peer_id(),
            signature,
        });
        Ok(self)
    }
}

fn retirement_ticket_bytes(ticket: &RetirementTicket) -> Vec<u8> {
    let mut bytes = ticket.peer.canonical_bytes();
    bytes.extend_from_slice(&ticket.signature.0);
    bytes
}
