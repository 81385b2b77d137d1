//! Key shares: a zone key wrapped for one specific peer.

use crate::zone_key::{ZoneKey, ZoneKeyId};
use orbit_core::{Canon, Canonical, ExtraFields, OrbitError, PeerId, Result, ZoneId};
use orbit_crypto::{
    seal_for_peer, verify_signature, KeyVault, SealedBox, Signature, SigningPublicKey,
    SymmetricKey,
};
use orbit_trust::PeerIdentity;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SHARE_DOMAIN: &str = "orbit-key-share-v1";

/// One zone key, sealed to one receiving peer and signed by the sender.
///
/// Shares are superseded, never mutated: rotation issues fresh shares at
/// the next epoch and the [`ShareLog`](crate::ShareLog) marks older ones
/// poisoned. The signature covers the canonical encoding including unknown
/// forward-compatible fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    /// The zone whose key is being shared.
    pub zone: ZoneId,
    /// Which zone key version this share carries.
    pub zone_key_id: ZoneKeyId,
    /// The carried key's rotation counter, for display and ordering.
    pub key_version: u32,
    /// The peer that issued and signed this share.
    pub sender: PeerId,
    /// The peer this share is sealed to.
    pub receiver: PeerId,
    /// The zone key material, sealed to the receiver's encryption key.
    pub wrapped: SealedBox,
    /// Rotation epoch; receivers prefer the highest epoch per zone.
    pub epoch: u64,
    /// Unknown fields carried verbatim inside the signed image.
    pub extra_fields: ExtraFields,
    /// Sender's signature over the canonical bytes.
    pub signature: Signature,
}

impl Canonical for KeyShare {
    fn canonical_bytes(&self) -> Vec<u8> {
        Canon::new(SHARE_DOMAIN)
            .str(self.zone.as_str())
            .bytes(self.zone_key_id.uuid().as_bytes())
            .u32(self.key_version)
            .bytes(self.sender.fingerprint().as_bytes())
            .bytes(self.receiver.fingerprint().as_bytes())
            .bytes(&self.wrapped.encapped_key)
            .bytes(&self.wrapped.ciphertext)
            .u64(self.epoch)
            .extra(&self.extra_fields)
            .finish()
    }
}

impl KeyShare {
    /// Verify the sender's signature against the sender's signing key.
    pub fn verify(&self, sender_key: &SigningPublicKey) -> Result<()> {
        if sender_key.peer_id() != self.sender {
            return Err(OrbitError::signature_invalid(format!(
                "share claims sender {} but was checked against {}",
                self.sender,
                sender_key.peer_id()
            )));
        }
        verify_signature(sender_key, &self.canonical_bytes(), &self.signature)
    }

    /// The HPKE context string binding this share's seal to its place in
    /// the hierarchy.
    fn seal_info(zone: &ZoneId, key_id: &ZoneKeyId, receiver: &PeerId, epoch: u64) -> String {
        format!("orbit-share:{zone}:{key_id}:{receiver}:{epoch}")
    }
}

/// Wrap `zone_key` for `receiver` and sign the share as `sender`.
pub fn share_zone_key<R: RngCore + CryptoRng>(
    zone_key: &ZoneKey,
    sender: &dyn KeyVault,
    receiver: &PeerIdentity,
    epoch: u64,
    rng: &mut R,
) -> Result<KeyShare> {
    receiver.verify()?;
    let info = KeyShare::seal_info(&zone_key.zone, &zone_key.key_id, &receiver.peer_id, epoch);
    let wrapped = seal_for_peer(
        zone_key.material.as_bytes(),
        &receiver.encryption_public,
        &info,
        rng,
    )?;

    let mut share = KeyShare {
        zone: zone_key.zone.clone(),
        zone_key_id: zone_key.key_id,
        key_version: zone_key.version,
        sender: sender.peer_id(),
        receiver: receiver.peer_id,
        wrapped,
        epoch,
        extra_fields: Vec::new(),
        signature: Signature(Vec::new()),
    };
    share.signature = sender.sign(&share.canonical_bytes())?;
    Ok(share)
}

/// Unwrap a zone key from a share addressed to this device.
///
/// Fails closed, in order: `Poisoned` when the share is superseded,
/// `UntrustedSender` when the sender is not in `trusted_senders` (the
/// trusted peer set at the share's epoch), `SignatureInvalid` when the
/// signature does not verify, and a crypto error when unsealing fails.
pub fn recover_zone_key(
    share: &KeyShare,
    poisoned: bool,
    recoverer: &dyn KeyVault,
    trusted_senders: &BTreeMap<PeerId, SigningPublicKey>,
) -> Result<ZoneKey> {
    if poisoned {
        return Err(OrbitError::poisoned(format!(
            "share for {} at epoch {} was superseded",
            share.zone_key_id, share.epoch
        )));
    }

    let sender_key = trusted_senders.get(&share.sender).ok_or_else(|| {
        OrbitError::untrusted_sender(format!(
            "share sender {} was not trusted at epoch {}",
            share.sender, share.epoch
        ))
    })?;
    share.verify(sender_key)?;

    if share.receiver != recoverer.peer_id() {
        return Err(OrbitError::not_authorized(format!(
            "share is sealed to {}, not {}",
            share.receiver,
            recoverer.peer_id()
        )));
    }

    let info = KeyShare::seal_info(&share.zone, &share.zone_key_id, &share.receiver, share.epoch);
    let material = recoverer.unseal(&share.wrapped, &info)?;
    Ok(ZoneKey {
        zone: share.zone.clone(),
        key_id: share.zone_key_id,
        material: SymmetricKey::try_from_slice(&material)?,
        version: share.key_version,
    })
}
