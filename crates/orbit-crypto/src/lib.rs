//! # Orbit Crypto
//!
//! Cryptographic building blocks for the secret synchronization engine:
//!
//! - Ed25519 signing keys and signature verification
//! - HPKE sealing of byte payloads to a peer's public encryption key
//!   (X25519 + HKDF-SHA256 + AES-256-GCM, single-shot mode)
//! - ChaCha20-Poly1305 AEAD under symmetric zone keys
//! - The [`KeyVault`] seam: private key material never crosses it in the
//!   clear, matching a secure-element or OS keychain deployment
//!
//! All operations here are stateless and synchronous; suspension points
//! live in the sync and pairing layers, not in crypto.

#![forbid(unsafe_code)]

pub mod aead;
pub mod keys;
pub mod seal;
pub mod vault;

pub use aead::{aead_decrypt, aead_encrypt, AeadCiphertext, SymmetricKey};
pub use keys::{verify_signature, EncryptionPublicKey, Signature, SigningPublicKey};
pub use seal::{seal_for_peer, SealedBox};
pub use vault::{KeyVault, SoftwareVault};
