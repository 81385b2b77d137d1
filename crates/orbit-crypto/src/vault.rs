//! The secure key storage seam.
//!
//! A [`KeyVault`] holds a device's private signing and decryption keys and
//! performs operations on the caller's behalf; private material never
//! crosses the trait boundary. Production deployments back this with a
//! secure element or OS keychain; [`SoftwareVault`] is the in-process
//! implementation used by tests and the simulator path.

use crate::keys::{EncryptionPublicKey, Signature, SigningPublicKey};
use crate::seal::{SealAead, SealKdf, SealKem, SealedBox};
use ed25519_dalek::Signer;
use hkdf::Hkdf;
use hpke::{single_shot_open, Deserializable, Kem, OpModeR};
use orbit_core::{OrbitError, PeerId, Result};
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Operations on a device's private keys.
///
/// Implementations must be safe to share across the zone actors and the
/// pairing channel; all methods are synchronous and stateless.
pub trait KeyVault: Send + Sync {
    /// The device's public signing key.
    fn signing_public(&self) -> SigningPublicKey;

    /// The device's public encryption key.
    fn encryption_public(&self) -> EncryptionPublicKey;

    /// Sign `data` with the device's private signing key.
    fn sign(&self, data: &[u8]) -> Result<Signature>;

    /// Open an HPKE [`SealedBox`] addressed to this device.
    fn unseal(&self, sealed: &SealedBox, info: &str) -> Result<Vec<u8>>;

    /// The peer id owned by this vault.
    fn peer_id(&self) -> PeerId {
        self.signing_public().peer_id()
    }
}

/// In-process vault holding raw key material.
pub struct SoftwareVault {
    signing: ed25519_dalek::SigningKey,
    decryption: <SealKem as Kem>::PrivateKey,
    encryption_public: EncryptionPublicKey,
}

impl SoftwareVault {
    /// Generate a vault with fresh random keys.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing = ed25519_dalek::SigningKey::generate(rng);
        let (decryption, encryption) = SealKem::gen_keypair(rng);
        Self::assemble(signing, decryption, encryption)
    }

    /// Derive a vault deterministically from a 32-byte seed.
    ///
    /// Signing and decryption keys come from independent HKDF expansions of
    /// the seed, so test fixtures are reproducible without key reuse across
    /// the two algorithms.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, &seed);

        let mut sign_ikm = Zeroizing::new([0u8; 32]);
        hk.expand(b"orbit-vault-signing", sign_ikm.as_mut())
            .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF output length"));
        let signing = ed25519_dalek::SigningKey::from_bytes(&sign_ikm);

        let mut hpke_ikm = Zeroizing::new([0u8; 32]);
        hk.expand(b"orbit-vault-hpke", hpke_ikm.as_mut())
            .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF output length"));
        let (decryption, encryption) = SealKem::derive_keypair(hpke_ikm.as_ref());

        Self::assemble(signing, decryption, encryption)
    }

    fn assemble(
        signing: ed25519_dalek::SigningKey,
        decryption: <SealKem as Kem>::PrivateKey,
        encryption: <SealKem as Kem>::PublicKey,
    ) -> Self {
        use hpke::Serializable;
        let encryption_public = EncryptionPublicKey(encryption.to_bytes().to_vec());
        Self {
            signing,
            decryption,
            encryption_public,
        }
    }
}

impl KeyVault for SoftwareVault {
    fn signing_public(&self) -> SigningPublicKey {
        SigningPublicKey(self.signing.verifying_key().to_bytes().to_vec())
    }

    fn encryption_public(&self) -> EncryptionPublicKey {
        self.encryption_public.clone()
    }

    fn sign(&self, data: &[u8]) -> Result<Signature> {
        Ok(Signature(self.signing.sign(data).to_bytes().to_vec()))
    }

    fn unseal(&self, sealed: &SealedBox, info: &str) -> Result<Vec<u8>> {
        let encapped_key = <SealKem as Kem>::EncappedKey::from_bytes(&sealed.encapped_key)
            .map_err(|e| OrbitError::crypto(format!("invalid encapsulated key: {e:?}")))?;

        single_shot_open::<SealAead, SealKdf, SealKem>(
            &OpModeR::Base,
            &self.decryption,
            &encapped_key,
            info.as_bytes(),
            &sealed.ciphertext,
            info.as_bytes(),
        )
        .map_err(|_| OrbitError::crypto("HPKE open failed"))
    }
}
