//! Envelope ↔ S3 user-metadata codec.
//!
//! Every envelope field is serialized into upstream object user-metadata
//! under the `s3ep-` prefix; binary fields are URL-safe base64 without
//! padding. The prefix is reserved: client metadata colliding with it is
//! rejected before anything reaches upstream, so an envelope can never be
//! forged from the outside. Unknown `s3ep-*` fields are ignored on read for
//! forward compatibility.

use super::envelope::Envelope;
use super::{CryptoError, DekAlgorithm, ProviderKind};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::collections::HashMap;

/// Metadata key names (stored as `x-amz-meta-{KEY}` on the upstream object).
///
/// The `H_*` constants are the full HTTP header names, derived from the bare
/// keys via `concat!` so they can never desync.
pub mod meta_keys {
    /// Reserved user-metadata namespace.
    pub const PREFIX: &str = "s3ep-";

    pub const KEK_PROVIDER: &str = "s3ep-kek-provider";
    pub const KEK_FINGERPRINT: &str = "s3ep-kek-fingerprint";
    pub const PROVIDER_ALIAS: &str = "s3ep-provider-alias";
    pub const DEK_ALGORITHM: &str = "s3ep-dek-algorithm";
    pub const ENCRYPTED_DEK: &str = "s3ep-encrypted-dek";
    pub const IV: &str = "s3ep-iv";
    pub const HMAC: &str = "s3ep-hmac";
    pub const CONTENT_LENGTH_PLAIN: &str = "s3ep-content-length-plain";

    /// S3 header prefix for user-defined metadata.
    pub const AMZ_META_PREFIX: &str = "x-amz-meta-";

    // Full x-amz-meta-s3ep-* header names — derived from bare keys to prevent desync.
    pub const H_KEK_PROVIDER: &str = concat!("x-amz-meta-", "s3ep-kek-provider");
    pub const H_KEK_FINGERPRINT: &str = concat!("x-amz-meta-", "s3ep-kek-fingerprint");
    pub const H_PROVIDER_ALIAS: &str = concat!("x-amz-meta-", "s3ep-provider-alias");
    pub const H_DEK_ALGORITHM: &str = concat!("x-amz-meta-", "s3ep-dek-algorithm");
    pub const H_ENCRYPTED_DEK: &str = concat!("x-amz-meta-", "s3ep-encrypted-dek");
    pub const H_IV: &str = concat!("x-amz-meta-", "s3ep-iv");
    pub const H_HMAC: &str = concat!("x-amz-meta-", "s3ep-hmac");
    pub const H_CONTENT_LENGTH_PLAIN: &str = concat!("x-amz-meta-", "s3ep-content-length-plain");
}

/// Serialize an envelope into bare-key user metadata (no `x-amz-meta-`).
pub fn encode_envelope(envelope: &Envelope) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    meta.insert(
        meta_keys::DEK_ALGORITHM.to_string(),
        envelope.dek_algorithm.name().to_string(),
    );
    meta.insert(
        meta_keys::KEK_PROVIDER.to_string(),
        envelope.kek_provider.name().to_string(),
    );
    meta.insert(
        meta_keys::KEK_FINGERPRINT.to_string(),
        URL_SAFE_NO_PAD.encode(&envelope.kek_fingerprint),
    );
    meta.insert(
        meta_keys::PROVIDER_ALIAS.to_string(),
        envelope.provider_alias.clone(),
    );
    if !envelope.encrypted_dek.is_empty() {
        meta.insert(
            meta_keys::ENCRYPTED_DEK.to_string(),
            URL_SAFE_NO_PAD.encode(&envelope.encrypted_dek),
        );
    }
    if !envelope.iv.is_empty() {
        meta.insert(meta_keys::IV.to_string(), URL_SAFE_NO_PAD.encode(&envelope.iv));
    }
    if let Some(ref hmac) = envelope.hmac {
        meta.insert(meta_keys::HMAC.to_string(), URL_SAFE_NO_PAD.encode(hmac));
    }
    if let Some(len) = envelope.content_length_plain {
        meta.insert(meta_keys::CONTENT_LENGTH_PLAIN.to_string(), len.to_string());
    }
    meta
}

fn required<'a>(
    meta: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str, CryptoError> {
    meta.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| CryptoError::InvalidEnvelope(format!("missing field '{key}'")))
}

fn decode_b64(key: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| CryptoError::InvalidEnvelope(format!("field '{key}' is not base64: {e}")))
}

/// Parse an envelope back out of upstream user metadata.
///
/// Returns `Ok(None)` when no `s3ep-dek-algorithm` field is present — the
/// object predates the proxy (or was written around it) and is streamed
/// through untouched. Core fields missing for a non-none algorithm fail the
/// read; unknown `s3ep-*` keys are ignored.
pub fn decode_envelope(meta: &HashMap<String, String>) -> Result<Option<Envelope>, CryptoError> {
    let algorithm = match meta.get(meta_keys::DEK_ALGORITHM) {
        Some(raw) => DekAlgorithm::parse(raw).ok_or_else(|| {
            CryptoError::InvalidEnvelope(format!("unknown dek-algorithm '{raw}'"))
        })?,
        None => return Ok(None),
    };

    let kek_provider = {
        let raw = required(meta, meta_keys::KEK_PROVIDER)?;
        ProviderKind::parse(raw)
            .ok_or_else(|| CryptoError::InvalidEnvelope(format!("unknown kek-provider '{raw}'")))?
    };
    let provider_alias = required(meta, meta_keys::PROVIDER_ALIAS)?.to_string();
    let kek_fingerprint = decode_b64(
        meta_keys::KEK_FINGERPRINT,
        required(meta, meta_keys::KEK_FINGERPRINT)?,
    )?;

    let encrypted_dek = match meta.get(meta_keys::ENCRYPTED_DEK) {
        Some(v) => decode_b64(meta_keys::ENCRYPTED_DEK, v)?,
        None if algorithm == DekAlgorithm::None => Vec::new(),
        None => {
            return Err(CryptoError::InvalidEnvelope(format!(
                "missing field '{}' for algorithm {}",
                meta_keys::ENCRYPTED_DEK,
                algorithm
            )))
        }
    };
    let iv = match meta.get(meta_keys::IV) {
        Some(v) => decode_b64(meta_keys::IV, v)?,
        None if algorithm == DekAlgorithm::None => Vec::new(),
        None => {
            return Err(CryptoError::InvalidEnvelope(format!(
                "missing field '{}' for algorithm {}",
                meta_keys::IV,
                algorithm
            )))
        }
    };
    let hmac = match meta.get(meta_keys::HMAC) {
        Some(v) => Some(decode_b64(meta_keys::HMAC, v)?),
        None => None,
    };
    let content_length_plain = match meta.get(meta_keys::CONTENT_LENGTH_PLAIN) {
        Some(v) => Some(v.parse::<u64>().map_err(|_| {
            CryptoError::InvalidEnvelope(format!(
                "field '{}' is not a decimal integer",
                meta_keys::CONTENT_LENGTH_PLAIN
            ))
        })?),
        None => None,
    };

    let envelope = Envelope {
        kek_provider,
        kek_fingerprint,
        provider_alias,
        dek_algorithm: algorithm,
        encrypted_dek,
        iv,
        hmac,
        content_length_plain,
    };
    envelope.validate()?;
    Ok(Some(envelope))
}

/// First client-supplied metadata key colliding with the reserved prefix,
/// if any. Callers reject the whole request when this returns `Some`.
pub fn find_reserved_key(meta: &HashMap<String, String>) -> Option<&str> {
    meta.keys()
        .map(|k| k.as_str())
        .find(|k| k.starts_with(meta_keys::PREFIX))
}

/// Whether a bare user-metadata key belongs to the envelope namespace.
pub fn is_envelope_key(key: &str) -> bool {
    key.starts_with(meta_keys::PREFIX)
}
