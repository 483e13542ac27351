//! Envelope encryption: KEK providers, DEK algorithms, HMAC integrity,
//! and the sidecar-metadata codec.
//!
//! The layering mirrors the envelope pattern: a fresh Data-Encryption Key
//! (DEK) is generated per object and used to encrypt the payload; the DEK is
//! wrapped by a long-lived Key-Encryption Key (KEK) and stored alongside the
//! ciphertext as object user-metadata. Decryption resolves the KEK by
//! `(provider, fingerprint)`, unwraps the DEK, and verifies ciphertext
//! integrity before the plaintext is trusted.

mod dek;
mod envelope;
mod hmac;
mod kek;
pub mod metadata;

pub use dek::{
    ctr_apply_at, ctr_keystream_at, gcm_open, gcm_seal, generate_dek, CtrStream, DekAlgorithm,
    DekMaterial, AES_BLOCK_LEN, CTR_IV_LEN, DEK_LEN, GCM_NONCE_LEN, GCM_TAG_LEN,
};
pub use envelope::{Envelope, EnvelopeEngine, MultipartCryptoState};
pub use hmac::{hmac_tag, verify_tag, HmacVerifyStream, SequentialHmac, HMAC_TAG_LEN};
pub use kek::{AesKek, KekProvider, KekRing, LoadedKek, ProviderKind, RsaKek, TinkKek, KEK_FINGERPRINT_LEN};

use thiserror::Error;

/// Errors from the envelope-encryption subsystem.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No loaded KEK matches the `(provider, fingerprint)` pair stored on the object.
    #[error("no loaded KEK matches provider '{provider}' fingerprint {fingerprint}")]
    KeyNotFound {
        provider: String,
        fingerprint: String,
    },

    /// A KEK exists but cannot service the operation (wrong key, missing
    /// private half, fingerprint mismatch on unwrap).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("DEK wrap failed: {0}")]
    WrapFailed(String),

    #[error("DEK unwrap failed: {0}")]
    UnwrapFailed(String),

    /// HMAC mismatch or AEAD tag failure. Never carries key material.
    #[error("ciphertext integrity check failed")]
    IntegrityFailure,

    /// The external KMS backing a `tink` provider could not be reached.
    #[error("KMS unavailable: {0}")]
    KmsUnavailable(String),

    /// Stored envelope metadata is missing or inconsistent.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The license gate refused to activate a provider type.
    #[error("license restriction: provider type '{0}' is not permitted")]
    LicenseRestriction(String),

    /// Transported error from the byte stream feeding a crypto adapter.
    #[error("stream error: {0}")]
    Stream(String),
}
