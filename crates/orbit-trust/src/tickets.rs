//! Join and retirement tickets.
//!
//! An [`ApplicationTicket`] is a candidate's signed statement "I want to
//! join", counter-signed by an approving member once accepted. A
//! [`RetirementTicket`] is a peer's signed statement "this peer is no
//! longer trusted", kept forever so revocation stays detectable.

use crate::identity::PeerIdentity;
use orbit_core::{hash, Canon, Canonical, OrbitError, PeerId, Result};
use orbit_crypto::{verify_signature, KeyVault, Signature, SigningPublicKey};
use serde::{Deserialize, Serialize};

const APPLICATION_DOMAIN: &str = "orbit-application-v1";
const APPROVAL_DOMAIN: &str = "orbit-approval-v1";
const RETIREMENT_DOMAIN: &str = "orbit-retirement-v1";

/// A candidate's signed request to join a circle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationTicket {
    /// The applying identity, embedded so the ticket is self-contained.
    pub candidate: PeerIdentity,
    /// Candidate's signature over the application image.
    pub signature: Signature,
    /// Filled in by the accepting member.
    pub approval: Option<Approval>,
}

/// A member's counter-signature on an accepted application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    /// The member who accepted the application.
    pub approver: PeerId,
    /// Approver's signature over the approval image.
    pub signature: Signature,
}

impl ApplicationTicket {
    /// Issue an application for `identity`.
    ///
    /// Fails with `NotAuthorized` when the caller's vault does not own the
    /// identity's signing key.
    pub fn issue(identity: &PeerIdentity, vault: &dyn KeyVault) -> Result<Self> {
        if vault.peer_id() != identity.peer_id {
            return Err(OrbitError::not_authorized(format!(
                "cannot apply on behalf of {}",
                identity.peer_id
            )));
        }
        identity.verify()?;
        let signature = vault.sign(&application_image(identity))?;
        Ok(Self {
            candidate: identity.clone(),
            signature,
            approval: None,
        })
    }

    /// Verify the candidate's identity and application signature, and the
    /// approval counter-signature when present.
    ///
    /// `approver_key` resolves the approver's public key from the circle;
    /// it is only consulted when an approval is attached.
    pub fn verify(
        &self,
        approver_key: impl Fn(&PeerId) -> Option<SigningPublicKey>,
    ) -> Result<()> {
        self.candidate.verify()?;
        verify_signature(
            &self.candidate.signing_public,
            &application_image(&self.candidate),
            &self.signature,
        )?;
        if let Some(approval) = &self.approval {
            let key = approver_key(&approval.approver).ok_or_else(|| {
                OrbitError::untrusted_sender(format!(
                    "approver {} is not a known member",
                    approval.approver
                ))
            })?;
            verify_signature(
                &key,
                &approval_image(&self.candidate, &approval.approver),
                &approval.signature,
            )?;
        }
        Ok(())
    }

    /// Counter-sign this application as an accepting member.
    pub fn approve(&self, approver: &dyn KeyVault) -> Result<Self> {
        let signature = approver.sign(&approval_image(&self.candidate, &approver.peer_id()))?;
        Ok(Self {
            candidate: self.candidate.clone(),
            signature: self.signature.clone(),
            approval: Some(Approval {
                approver: approver.peer_id(),
                signature,
            }),
        })
    }

    /// The applying peer's id.
    pub fn candidate_id(&self) -> PeerId {
        self.candidate.peer_id
    }
}

/// A signed statement that a peer is no longer trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetirementTicket {
    /// The retiring identity.
    pub peer: PeerIdentity,
    /// Signature by the retiring peer itself.
    pub signature: Signature,
}

impl RetirementTicket {
    /// Issue a retirement for `identity`.
    ///
    /// Fails with `NotAuthorized` when the caller's vault does not own the
    /// identity's signing key.
    pub fn issue(identity: &PeerIdentity, vault: &dyn KeyVault) -> Result<Self> {
        if vault.peer_id() != identity.peer_id {
            return Err(OrbitError::not_authorized(format!(
                "cannot retire {} without its signing key",
                identity.peer_id
            )));
        }
        let signature = vault.sign(&retirement_image(identity))?;
        Ok(Self {
            peer: identity.clone(),
            signature,
        })
    }

    /// Verify the embedded identity and the retirement signature.
    pub fn verify(&self) -> Result<()> {
        self.peer.verify()?;
        verify_signature(
            &self.peer.signing_public,
            &retirement_image(&self.peer),
            &self.signature,
        )
    }

    /// The retired peer's id.
    pub fn peer_id(&self) -> PeerId {
        self.peer.peer_id
    }
}

fn application_image(candidate: &PeerIdentity) -> Vec<u8> {
    Canon::new(APPLICATION_DOMAIN)
        .bytes(hash(&candidate.canonical_bytes()).as_bytes())
        .finish()
}

fn approval_image(candidate: &PeerIdentity, approver: &PeerId) -> Vec<u8> {
    Canon::new(APPROVAL_DOMAIN)
        .bytes(hash(&candidate.canonical_bytes()).as_bytes())
        .bytes(approver.fingerprint().as_bytes())
        .finish()
}

fn retirement_image(peer: &PeerIdentity) -> Vec<u8> {
    Canon::new(RETIREMENT_DOMAIN)
        .bytes(hash(&peer.canonical_bytes()).as_bytes())
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_crypto::SoftwareVault;

    fn identity(seed: u8) -> (PeerIdentity, SoftwareVault) {
        let vault = SoftwareVault::from_seed([seed; 32]);
        let identity =
            PeerIdentity::create(vec![("name".into(), format!("dev-{seed}"))], &vault).unwrap();
        (identity, vault)
    }

    #[test]
    fn application_round_trip() {
        let (id, vault) = identity(1);
        let ticket = ApplicationTicket::issue(&id, &vault).unwrap();
        ticket.verify(|_| None).unwrap();
        assert!(ticket.approval.is_none());
    }

    #[test]
    fn application_for_foreign_identity_is_not_authorized() {
        let (id, _) = identity(1);
        let (_, other_vault) = identity(2);
        let err = ApplicationTicket::issue(&id, &other_vault).unwrap_err();
        assert!(matches!(err, OrbitError::NotAuthorized { .. }));
    }

    #[test]
    fn approved_application_verifies_with_member_key() {
        let (candidate, candidate_vault) = identity(1);
        let (member, member_vault) = identity(2);

        let ticket = ApplicationTicket::issue(&candidate, &candidate_vault).unwrap();
        let approved = ticket.approve(&member_vault).unwrap();

        approved
            .verify(|id| {
                (*id == member.peer_id).then(|| member.signing_public.clone())
            })
            .unwrap();
    }

    #[test]
    fn approval_by_unknown_member_is_untrusted() {
        let (candidate, candidate_vault) = identity(1);
        let (_, member_vault) = identity(2);

        let approved = ApplicationTicket::issue(&candidate, &candidate_vault)
            .unwrap()
            .approve(&member_vault)
            .unwrap();

        let err = approved.verify(|_| None).unwrap_err();
        assert!(matches!(err, OrbitError::UntrustedSender { .. }));
    }

    #[test]
    fn retirement_round_trip() {
        let (id, vault) = identity(3);
        let ticket = RetirementTicket::issue(&id, &vault).unwrap();
        ticket.verify().unwrap();
        assert_eq!(ticket.peer_id(), id.peer_id);
    }

    #[test]
    fn retirement_needs_own_key() {
        let (id, _) = identity(3);
        let (_, other_vault) = identity(4);
        let err = RetirementTicket::issue(&id, &other_vault).unwrap_err();
        assert!(matches!(err, OrbitError::NotAuthorized { .. }));
    }
}
