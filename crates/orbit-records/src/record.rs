//! Encrypted secret records.

use orbit_core::{hash, Canon, Hash32, OrbitError, RecordId, Result, ZoneId};
use orbit_crypto::{aead_decrypt, aead_encrypt, AeadCiphertext};
use orbit_keys::{ZoneKey, ZoneKeyId};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

const RECORD_AAD_DOMAIN: &str = "orbit-record-aad-v1";

/// One keychain-like secret, encrypted under its zone's key.
///
/// The record id is stable across updates; the parent key id changes only
/// on re-keying. The AEAD associated data binds the ciphertext to its
/// identity, so a ciphertext cannot be replayed as a different record or
/// under a different key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Stable record identity.
    pub record_id: RecordId,
    /// The zone this record lives in.
    pub zone: ZoneId,
    /// Which zone key wraps this record.
    pub parent_key_id: ZoneKeyId,
    /// Nonce and ciphertext.
    pub sealed: AeadCiphertext,
    /// Update counter for this record, bumped by the writing device.
    pub generation: u64,
    /// Ciphertext encoding version.
    pub encoding_version: u16,
}

impl SecretRecord {
    /// Current ciphertext encoding version.
    pub const ENCODING_VERSION: u16 = 1;

    /// Encrypt `plaintext` as record `record_id` under `zone_key`.
    pub fn encrypt<R: RngCore + CryptoRng>(
        plaintext: &[u8],
        zone_key: &ZoneKey,
        record_id: RecordId,
        generation: u64,
        rng: &mut R,
    ) -> Result<Self> {
        let aad = record_aad(
            &record_id,
            &zone_key.zone,
            &zone_key.key_id,
            generation,
            Self::ENCODING_VERSION,
        );
        let sealed = aead_encrypt(&zone_key.material, plaintext, &aad, rng)?;
        Ok(Self {
            record_id,
            zone: zone_key.zone.clone(),
            parent_key_id: zone_key.key_id,
            sealed,
            generation,
            encoding_version: Self::ENCODING_VERSION,
        })
    }

    /// Decrypt this record with `zone_key`.
    ///
    /// Fails with a `Decrypt` error when the key does not match the
    /// record's parent key, or when the ciphertext or its binding was
    /// tampered with.
    pub fn decrypt(&self, zone_key: &ZoneKey) -> Result<Vec<u8>> {
        if zone_key.key_id != self.parent_key_id {
            return Err(OrbitError::decrypt(format!(
                "{} is wrapped by {}, not {}",
                self.record_id, self.parent_key_id, zone_key.key_id
            )));
        }
        let aad = record_aad(
            &self.record_id,
            &self.zone,
            &self.parent_key_id,
            self.generation,
            self.encoding_version,
        );
        aead_decrypt(&zone_key.material, &self.sealed, &aad)
    }

    /// Content hash over ciphertext and metadata, as digested by zone
    /// manifests.
    pub fn record_hash(&self) -> Hash32 {
        let image = Canon::new("orbit-record-hash-v1")
            .bytes(self.record_id.uuid().as_bytes())
            .str(self.zone.as_str())
            .bytes(self.parent_key_id.uuid().as_bytes())
            .bytes(&self.sealed.nonce)
            .bytes(&self.sealed.ciphertext)
            .u64(self.generation)
            .u32(u32::from(self.encoding_version))
            .finish();
        hash(&image)
    }

    /// Re-encrypt an existing record under a rotated zone key.
    pub fn rekeyed<R: RngCore + CryptoRng>(
        &self,
        old_key: &ZoneKey,
        new_key: &ZoneKey,
        rng: &mut R,
    ) -> Result<Self> {
        let plaintext = self.decrypt(old_key)?;
        Self::encrypt(
            &plaintext,
            new_key,
            self.record_id,
            self.generation + 1,
            rng,
        )
    }
}

fn record_aad(
    record_id: &RecordId,
    zone: &ZoneId,
    parent_key_id: &ZoneKeyId,
    generation: u64,
    encoding_version: u16,
) -> Vec<u8> {
    Canon::new(RECORD_AAD_DOMAIN)
        .bytes(record_id.uuid().as_bytes())
        .str(zone.as_str())
        .bytes(parent_key_id.uuid().as_bytes())
        .u64(generation)
        .u32(u32::from(encoding_version))
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn key(seed: u64) -> (ZoneKey, ChaCha20Rng) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let key = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        (key, rng)
    }

    #[test]
    fn round_trip() {
        let (key, mut rng) = key(1);
        let record =
            SecretRecord::encrypt(b"hunter2", &key, RecordId::new(), 1, &mut rng).unwrap();
        assert_eq!(record.decrypt(&key).unwrap(), b"hunter2");
    }

    #[test]
    fn wrong_key_version_is_refused_up_front() {
        let (key, mut rng) = key(2);
        let rotated = key.rotated(&mut rng);
        let record =
            SecretRecord::encrypt(b"hunter2", &key, RecordId::new(), 1, &mut rng).unwrap();
        let err = record.decrypt(&rotated).unwrap_err();
        assert!(matches!(err, OrbitError::Decrypt { .. }));
    }

    #[test]
    fn swapped_record_id_breaks_the_binding() {
        let (key, mut rng) = key(3);
        let mut record =
            SecretRecord::encrypt(b"hunter2", &key, RecordId::new(), 1, &mut rng).unwrap();
        record.record_id = RecordId::new();
        assert!(record.decrypt(&key).is_err());
    }

    #[test]
    fn record_hash_tracks_content() {
        let (key, mut rng) = key(4);
        let id = RecordId::new();
        let a = SecretRecord::encrypt(b"one", &key, id, 1, &mut rng).unwrap();
        let b = SecretRecord::encrypt(b"two", &key, id, 2, &mut rng).unwrap();
        assert_ne!(a.record_hash(), b.record_hash());
        assert_eq!(a.record_hash(), a.clone().record_hash());
    }

    #[test]
    fn rekeying_preserves_plaintext_and_id() {
        let (key, mut rng) = key(5);
        let rotated = key.rotated(&mut rng);
        let record =
            SecretRecord::encrypt(b"hunter2", &key, RecordId::new(), 1, &mut rng).unwrap();
        let rekeyed = record.rekeyed(&key, &rotated, &mut rng).unwrap();
        assert_eq!(rekeyed.record_id, record.record_id);
        assert_eq!(rekeyed.parent_key_id, rotated.key_id);
        assert_eq!(rekeyed.decrypt(&rotated).unwrap(), b"hunter2");
        assert!(rekeyed.decrypt(&key).is_err());
    }
}
