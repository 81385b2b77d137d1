//! Public key and signature types.
//!
//! Serialized byte representations so they can travel inside signed,
//! versioned structures; the dalek types are reconstructed at the point of
//! use.

use orbit_core::{OrbitError, PeerId, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ed25519 public signing key (32-byte serialized form).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigningPublicKey(pub Vec<u8>);

impl SigningPublicKey {
    /// The peer id derived from this key's fingerprint.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_signing_key(&self.0)
    }

    fn to_dalek(&self) -> Result<ed25519_dalek::VerifyingKey> {
        let bytes: [u8; 32] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| OrbitError::crypto("signing public key must be 32 bytes"))?;
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|e| OrbitError::crypto(format!("malformed signing public key: {e}")))
    }
}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey({})", hex::encode(&self.0[..4.min(self.0.len())]))
    }
}

/// X25519 public encryption key for HPKE sealing (32-byte serialized form).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionPublicKey(pub Vec<u8>);

impl fmt::Debug for EncryptionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncryptionPublicKey({})",
            hex::encode(&self.0[..4.min(self.0.len())])
        )
    }
}

/// Detached Ed25519 signature (64-byte serialized form).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    fn to_dalek(&self) -> Result<ed25519_dalek::Signature> {
        ed25519_dalek::Signature::from_slice(&self.0)
            .map_err(|e| OrbitError::signature_invalid(format!("malformed signature: {e}")))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..4.min(self.0.len())]))
    }
}

/// Verify a detached signature over `data`.
///
/// Returns `SignatureInvalid` when verification fails; the caller decides
/// whether that drops a record or aborts an operation, but never ignores it.
pub fn verify_signature(
    public: &SigningPublicKey,
    data: &[u8],
    signature: &Signature,
) -> Result<()> {
    let key = public.to_dalek()?;
    let sig = signature.to_dalek()?;
    key.verify_strict(data, &sig)
        .map_err(|_| OrbitError::signature_invalid(format!("bad signature from {}", public.peer_id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signer;

    fn keypair(seed: u8) -> (ed25519_dalek::SigningKey, SigningPublicKey) {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
        let public = SigningPublicKey(signing.verifying_key().to_bytes().to_vec());
        (signing, public)
    }

    #[test]
    fn valid_signature_verifies() {
        let (signing, public) = keypair(7);
        let sig = Signature(signing.sign(b"message").to_bytes().to_vec());
        verify_signature(&public, b"message", &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let (signing, public) = keypair(7);
        let sig = Signature(signing.sign(b"message").to_bytes().to_vec());
        let err = verify_signature(&public, b"messagf", &sig).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn wrong_key_fails() {
        let (signing, _) = keypair(7);
        let (_, other_public) = keypair(8);
        let sig = Signature(signing.sign(b"message").to_bytes().to_vec());
        assert!(verify_signature(&other_public, b"message", &sig).is_err());
    }

    #[test]
    fn truncated_key_is_a_crypto_error() {
        let bad = SigningPublicKey(vec![1, 2, 3]);
        let sig = Signature(vec![0; 64]);
        let err = verify_signature(&bad, b"m", &sig).unwrap_err();
        assert!(matches!(err, OrbitError::Crypto { .. }));
    }
}
