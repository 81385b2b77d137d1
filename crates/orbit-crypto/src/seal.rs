//! HPKE sealing of payloads to a peer's public encryption key.
//!
//! Single-shot base mode over X25519 + HKDF-SHA256 + AES-256-GCM. The
//! `info` context string doubles as AAD so a box sealed for one purpose
//! (say, a key share) can never be opened as another.

use crate::keys::EncryptionPublicKey;
use hpke::aead::AesGcm256;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{single_shot_seal, Deserializable, Kem, OpModeS, Serializable};
use orbit_core::{OrbitError, Result};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

pub(crate) type SealKem = X25519HkdfSha256;
pub(crate) type SealKdf = HkdfSha256;
pub(crate) type SealAead = AesGcm256;

/// An HPKE-sealed payload: encapsulated ephemeral key plus ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Encapsulated ephemeral public key.
    pub encapped_key: Vec<u8>,
    /// AEAD ciphertext (tag integrated).
    pub ciphertext: Vec<u8>,
}

/// Seal `plaintext` so that only the holder of `recipient`'s private key
/// can open it.
pub fn seal_for_peer<R: RngCore + CryptoRng>(
    plaintext: &[u8],
    recipient: &EncryptionPublicKey,
    info: &str,
    rng: &mut R,
) -> Result<SealedBox> {
    let recipient_pk = <SealKem as Kem>::PublicKey::from_bytes(&recipient.0)
        .map_err(|e| OrbitError::crypto(format!("invalid recipient encryption key: {e:?}")))?;

    let (encapped_key, ciphertext) = single_shot_seal::<SealAead, SealKdf, SealKem, _>(
        &OpModeS::Base,
        &recipient_pk,
        info.as_bytes(),
        plaintext,
        info.as_bytes(),
        rng,
    )
    .map_err(|e| OrbitError::crypto(format!("HPKE seal failed: {e:?}")))?;

    Ok(SealedBox {
        encapped_key: encapped_key.to_bytes().to_vec(),
        ciphertext,
    })
}
