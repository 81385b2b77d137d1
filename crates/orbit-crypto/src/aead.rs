//! Symmetric AEAD under zone keys.
//!
//! ChaCha20-Poly1305 with a random 12-byte nonce carried beside the
//! ciphertext. The associated data binds a ciphertext to its record and
//! zone so it cannot be replayed under another identity.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use orbit_core::{OrbitError, Result};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 32-byte symmetric key material. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Generate fresh random key material.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing key material.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Reconstruct from a slice, e.g. after unsealing a key share.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OrbitError::crypto("symmetric key must be 32 bytes"))?;
        Ok(Self(arr))
    }

    /// Raw key bytes, for sealing into a key share.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material never reaches logs.
        write!(f, "SymmetricKey(..)")
    }
}

/// AEAD output: nonce plus ciphertext (Poly1305 tag appended inside).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeadCiphertext {
    /// 12-byte nonce used for this encryption.
    pub nonce: [u8; 12],
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under `key`, binding `aad`.
pub fn aead_encrypt<R: RngCore + CryptoRng>(
    key: &SymmetricKey,
    plaintext: &[u8],
    aad: &[u8],
    rng: &mut R,
) -> Result<AeadCiphertext> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; 12];
    rng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| OrbitError::crypto("AEAD encryption failed"))?;
    Ok(AeadCiphertext { nonce, ciphertext })
}

/// Decrypt an [`AeadCiphertext`] under `key`, checking `aad`.
///
/// Any mismatch (wrong key, tampered ciphertext, different AAD) surfaces as
/// a `Decrypt` error; the plaintext is never partially released.
pub fn aead_decrypt(key: &SymmetricKey, sealed: &AeadCiphertext, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad,
            },
        )
        .map_err(|_| OrbitError::decrypt("AEAD authentication failed"))
}
