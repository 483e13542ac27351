//! Data-Encryption-Key algorithms: one-shot AES-256-GCM for small payloads,
//! seekable AES-256-CTR for streaming and multipart payloads, and the
//! identity transform for unencrypted operation.
//!
//! CTR layout follows the 12-byte nonce prefix + 4-byte big-endian block
//! counter convention, so the starting counter for a payload slice beginning
//! at plaintext byte `B` is `B / 16`. `Ctr32BE` increments exactly that
//! trailing 32-bit word.

use super::CryptoError;
use aes::Aes256;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use bytes::{Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr32BE;
use futures::stream::BoxStream;
use futures::Stream;
use rand::rngs::OsRng;
use rand::RngCore;
use std::pin::Pin;
use std::task::{Context, Poll};
use zeroize::Zeroizing;

/// DEK length in bytes (AES-256).
pub const DEK_LEN: usize = 32;
/// GCM nonce length in bytes.
pub const GCM_NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes (appended to the ciphertext).
pub const GCM_TAG_LEN: usize = 16;
/// CTR IV length in bytes: 12-byte nonce prefix + 4-byte block counter.
pub const CTR_IV_LEN: usize = 16;
/// AES block length in bytes.
pub const AES_BLOCK_LEN: u64 = 16;

type Aes256Ctr32 = Ctr32BE<Aes256>;

/// Payload encryption algorithm recorded in the object envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DekAlgorithm {
    /// One-shot authenticated encryption; ciphertext = plaintext + 16-byte tag.
    AesGcm,
    /// Streaming counter mode; ciphertext length equals plaintext length.
    /// Always paired with an HMAC-SHA-256 over the ciphertext.
    AesCtr,
    /// Identity transform.
    None,
}

impl DekAlgorithm {
    /// Wire name stored in `s3ep-dek-algorithm`.
    pub fn name(&self) -> &'static str {
        match self {
            DekAlgorithm::AesGcm => "aes-gcm",
            DekAlgorithm::AesCtr => "aes-ctr",
            DekAlgorithm::None => "none",
        }
    }

    /// Parse the wire name back; unknown names are an envelope error.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "aes-gcm" => Some(DekAlgorithm::AesGcm),
            "aes-ctr" => Some(DekAlgorithm::AesCtr),
            "none" => Some(DekAlgorithm::None),
            _ => None,
        }
    }

    /// Whether this algorithm requires an HMAC tag in the envelope.
    pub fn requires_hmac(&self) -> bool {
        matches!(self, DekAlgorithm::AesCtr)
    }
}

impl std::fmt::Display for DekAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Freshly generated per-object key material. The key is zeroized on drop.
pub struct DekMaterial {
    pub key: Zeroizing<[u8; DEK_LEN]>,
    /// 12 bytes for GCM, 16 bytes (counter word zeroed) for CTR, empty for none.
    pub iv: Vec<u8>,
    pub algorithm: DekAlgorithm,
}

/// Generate a fresh DEK + IV for one object or one multipart upload.
///
/// A `(dek, iv)` pair is never reused across objects; counter-range safety
/// within a multipart upload comes from parts occupying disjoint plaintext
/// offsets.
pub fn generate_dek(algorithm: DekAlgorithm) -> DekMaterial {
    let mut key = Zeroizing::new([0u8; DEK_LEN]);
    let mut iv = Vec::new();
    match algorithm {
        DekAlgorithm::AesGcm => {
            OsRng.fill_bytes(key.as_mut());
            iv = vec![0u8; GCM_NONCE_LEN];
            OsRng.fill_bytes(&mut iv);
        }
        DekAlgorithm::AesCtr => {
            OsRng.fill_bytes(key.as_mut());
            iv = vec![0u8; CTR_IV_LEN];
            // Random 12-byte nonce prefix; the trailing 4-byte counter starts at 0.
            OsRng.fill_bytes(&mut iv[..GCM_NONCE_LEN]);
        }
        DekAlgorithm::None => {}
    }
    DekMaterial {
        key,
        iv,
        algorithm,
    }
}

/// One-shot AES-256-GCM seal. Returns ciphertext with the tag appended.
pub fn gcm_seal(key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("GCM key must be 32 bytes".to_string()))?;
    if nonce.len() != GCM_NONCE_LEN {
        return Err(CryptoError::InvalidEnvelope(format!(
            "GCM nonce must be {} bytes, got {}",
            GCM_NONCE_LEN,
            nonce.len()
        )));
    }
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::WrapFailed("GCM encryption failed".to_string()))
}

/// One-shot AES-256-GCM open. Tag failure is an integrity error, not a key error.
pub fn gcm_open(key: &[u8], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("GCM key must be 32 bytes".to_string()))?;
    if nonce.len() != GCM_NONCE_LEN {
        return Err(CryptoError::InvalidEnvelope(format!(
            "GCM nonce must be {} bytes, got {}",
            GCM_NONCE_LEN,
            nonce.len()
        )));
    }
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::IntegrityFailure)
}

/// Build an AES-256-CTR keystream positioned at `plaintext_offset` bytes.
///
/// The offset does not need to be block-aligned: the keystream is sought to
/// the exact byte position, which reduces to the `offset / 16` block counter
/// for aligned multipart parts.
pub fn ctr_keystream_at(
    key: &[u8],
    iv: &[u8],
    plaintext_offset: u64,
) -> Result<Aes256Ctr32, CryptoError> {
    if iv.len() != CTR_IV_LEN {
        return Err(CryptoError::InvalidEnvelope(format!(
            "CTR IV must be {} bytes, got {}",
            CTR_IV_LEN,
            iv.len()
        )));
    }
    let mut cipher = Aes256Ctr32::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKey("CTR key must be 32 bytes".to_string()))?;
    cipher.seek(plaintext_offset);
    Ok(cipher)
}

/// Apply the CTR transform in place over a buffered payload starting at
/// `plaintext_offset`. CTR is an involution, so this both encrypts and decrypts.
pub fn ctr_apply_at(
    key: &[u8],
    iv: &[u8],
    plaintext_offset: u64,
    data: &mut [u8],
) -> Result<(), CryptoError> {
    let mut cipher = ctr_keystream_at(key, iv, plaintext_offset)?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Stream adapter applying an AES-CTR keystream to each chunk as it passes.
///
/// Used on the GET path to decrypt upstream ciphertext on the wire. The same
/// adapter encrypts, since CTR is symmetric.
pub struct CtrStream {
    inner: BoxStream<'static, Result<Bytes, CryptoError>>,
    cipher: Aes256Ctr32,
}

impl CtrStream {
    pub fn new(
        inner: BoxStream<'static, Result<Bytes, CryptoError>>,
        key: &[u8],
        iv: &[u8],
        plaintext_offset: u64,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            inner,
            cipher: ctr_keystream_at(key, iv, plaintext_offset)?,
        })
    }
}

impl Stream for CtrStream {
    type Item = Result<Bytes, CryptoError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let mut buf = BytesMut::from(&chunk[..]);
                self.cipher.apply_keystream(&mut buf);
                Poll::Ready(Some(Ok(buf.freeze())))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
