//! Self-signed peer identities.

use orbit_core::{hash, Canon, Canonical, ExtraFields, Hash32, OrbitError, PeerId, Result};
use orbit_crypto::{verify_signature, EncryptionPublicKey, KeyVault, Signature, SigningPublicKey};
use serde::{Deserialize, Serialize};

const IDENTITY_DOMAIN: &str = "orbit-peer-identity-v1";

/// One device's public identity: versioned, self-describing, immutable
/// once created.
///
/// The signature covers the canonical encoding including any unknown
/// forward-compatible fields, so future fields cannot be stripped without
/// invalidating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Fingerprint of the signing key; the peer's stable identity.
    pub peer_id: PeerId,
    /// Public signing key.
    pub signing_public: SigningPublicKey,
    /// Public encryption key for key shares and pairing payloads.
    pub encryption_public: EncryptionPublicKey,
    /// Ordered device attributes (model, OS build, display name).
    pub device_info: Vec<(String, String)>,
    /// Identity format version.
    pub version: u32,
    /// Unknown fields carried verbatim inside the signed image.
    pub extra_fields: ExtraFields,
    /// Self-signature over the canonical bytes.
    pub signature: Signature,
}

impl Canonical for PeerIdentity {
    fn canonical_bytes(&self) -> Vec<u8> {
        Canon::new(IDENTITY_DOMAIN)
            .u32(self.version)
            .bytes(&self.signing_public.0)
            .bytes(&self.encryption_public.0)
            .pairs(
                self.device_info
                    .iter()
                    .map(|(k, v)| (k.as_bytes(), v.as_bytes())),
            )
            .extra(&self.extra_fields)
            .finish()
    }
}

impl PeerIdentity {
    /// Current identity format version.
    pub const VERSION: u32 = 1;

    /// Create and self-sign an identity for the device owning `vault`.
    ///
    /// Fails with a crypto error if the device cannot produce a signature.
    pub fn create(device_info: Vec<(String, String)>, vault: &dyn KeyVault) -> Result<Self> {
        let mut identity = Self {
            peer_id: vault.peer_id(),
            signing_public: vault.signing_public(),
            encryption_public: vault.encryption_public(),
            device_info,
            version: Self::VERSION,
            extra_fields: Vec::new(),
            signature: Signature(Vec::new()),
        };
        identity.signature = vault.sign(&identity.canonical_bytes())?;
        Ok(identity)
    }

    /// Verify the self-signature and the peer-id/key binding.
    pub fn verify(&self) -> Result<()> {
        if self.peer_id != self.signing_public.peer_id() {
            return Err(OrbitError::signature_invalid(format!(
                "{} does not match its signing key fingerprint",
                self.peer_id
            )));
        }
        verify_signature(
            &self.signing_public,
            &self.canonical_bytes(),
            &self.signature,
        )
    }

    /// True when `other` is the same peer (same signing key fingerprint),
    /// regardless of gestalt differences.
    pub fn same_key(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }

    /// Full-content hash used for update detection: two copies of an
    /// identity are interchangeable iff their gestalt hashes match.
    pub fn gestalt_hash(&self) -> Hash32 {
        let mut image = self.canonical_bytes();
        image.extend_from_slice(&self.signature.0);
        hash(&image)
    }

    /// True when `other` is byte-for-byte the same identity.
    pub fn same_gestalt(&self, other: &Self) -> bool {
        self.gestalt_hash() == other.gestalt_hash()
    }
}
