//! The envelope engine: composes a KEK provider with a DEK algorithm,
//! emits the sidecar envelope on encrypt, and inverts it (with mandatory
//! integrity verification for CTR) on decrypt.

use super::dek::{self, DekAlgorithm, DekMaterial};
use super::hmac::{hmac_tag, HmacVerifyStream};
use super::kek::{KekRing, ProviderKind};
use super::CryptoError;
use arc_swap::ArcSwap;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Sidecar metadata attached to every object the proxy writes.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kek_provider: ProviderKind,
    pub kek_fingerprint: Vec<u8>,
    /// Symbolic name of the encryption method instance that wrapped the DEK.
    /// Enables key rotation without re-encryption.
    pub provider_alias: String,
    pub dek_algorithm: DekAlgorithm,
    pub encrypted_dek: Vec<u8>,
    pub iv: Vec<u8>,
    /// HMAC-SHA-256 over the ciphertext. Required for `aes-ctr`.
    pub hmac: Option<Vec<u8>>,
    /// Decoded payload length. Required for `aes-ctr`, where the upstream
    /// store only knows the (equal) ciphertext length and GCM's tag overhead
    /// does not apply.
    pub content_length_plain: Option<u64>,
}

impl Envelope {
    /// Check the structural invariants of a stored envelope.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.dek_algorithm.requires_hmac() && self.hmac.as_ref().map_or(true, |h| h.is_empty()) {
            return Err(CryptoError::InvalidEnvelope(
                "aes-ctr envelope missing hmac".to_string(),
            ));
        }
        let none_provider = self.kek_provider == ProviderKind::None;
        let empty_dek = self.encrypted_dek.is_empty();
        if none_provider != empty_dek {
            return Err(CryptoError::InvalidEnvelope(
                "kek-provider 'none' must pair with an empty encrypted-dek".to_string(),
            ));
        }
        if none_provider && self.dek_algorithm != DekAlgorithm::None {
            return Err(CryptoError::InvalidEnvelope(format!(
                "kek-provider 'none' cannot carry dek-algorithm {}",
                self.dek_algorithm
            )));
        }
        Ok(())
    }
}

/// Result of a buffered encrypt: ciphertext plus its fully populated envelope.
pub struct EncryptedObject {
    pub ciphertext: Bytes,
    pub envelope: Envelope,
}

/// Key material and envelope seed for one multipart upload: fixed for the
/// life of the upload; the HMAC and plaintext length are folded in at
/// completion time by the coordinator.
pub struct MultipartCryptoState {
    pub dek: DekMaterial,
    pub encrypted_dek: Vec<u8>,
    pub kek_provider: ProviderKind,
    pub kek_fingerprint: Vec<u8>,
    pub provider_alias: String,
}

impl MultipartCryptoState {
    /// Assemble the final envelope once all parts are sealed.
    pub fn into_envelope(self, hmac: Option<[u8; 32]>, content_length_plain: u64) -> Envelope {
        Envelope {
            kek_provider: self.kek_provider,
            kek_fingerprint: self.kek_fingerprint,
            provider_alias: self.provider_alias,
            dek_algorithm: self.dek.algorithm,
            encrypted_dek: self.encrypted_dek,
            iv: self.dek.iv,
            hmac: hmac.map(|t| t.to_vec()),
            content_length_plain: Some(content_length_plain),
        }
    }

    /// Borrowing variant of [`Self::into_envelope`], for callers that still
    /// need the DEK afterwards.
    pub fn clone_into_envelope(&self, hmac: Option<[u8; 32]>, content_length_plain: u64) -> Envelope {
        Envelope {
            kek_provider: self.kek_provider,
            kek_fingerprint: self.kek_fingerprint.clone(),
            provider_alias: self.provider_alias.clone(),
            dek_algorithm: self.dek.algorithm,
            encrypted_dek: self.encrypted_dek.clone(),
            iv: self.dek.iv.clone(),
            hmac: hmac.map(|t| t.to_vec()),
            content_length_plain: Some(content_length_plain),
        }
    }
}

/// Composes the active KEK with a DEK algorithm. Holds the hot-swappable
/// ring so rotations are visible to in-flight traffic without restarts.
#[derive(Clone)]
pub struct EnvelopeEngine {
    ring: Arc<ArcSwap<KekRing>>,
}

impl EnvelopeEngine {
    pub fn new(ring: Arc<ArcSwap<KekRing>>) -> Self {
        Self { ring }
    }

    pub fn ring(&self) -> Arc<KekRing> {
        self.ring.load_full()
    }

    /// Atomically replace the provider set (key rotation).
    pub fn rotate(&self, ring: KekRing) {
        self.ring.store(Arc::new(ring));
    }

    /// The DEK algorithm actually used for a write, given the requested one.
    /// A `none` KEK provider forces the identity transform: there is nothing
    /// to wrap a real DEK with.
    fn effective_algorithm(&self, requested: DekAlgorithm) -> DekAlgorithm {
        if self.ring.load().active().kind() == ProviderKind::None {
            DekAlgorithm::None
        } else {
            requested
        }
    }

    /// Encrypt a buffered payload, producing ciphertext and its envelope.
    ///
    /// The HMAC is computed over the ciphertext for CTR; GCM carries its own
    /// authentication tag. Wrap failure aborts the upload before any bytes
    /// reach upstream.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        object_key: &str,
        requested: DekAlgorithm,
    ) -> Result<EncryptedObject, CryptoError> {
        let algorithm = self.effective_algorithm(requested);
        let ring = self.ring.load_full();
        let active = ring.active();
        let material = dek::generate_dek(algorithm);
        let encrypted_dek = active
            .provider
            .wrap(material.key.as_ref(), object_key.as_bytes())
            .await?;

        let (ciphertext, hmac) = match algorithm {
            DekAlgorithm::AesGcm => {
                let ct = dek::gcm_seal(
                    material.key.as_ref(),
                    &material.iv,
                    plaintext,
                    object_key.as_bytes(),
                )?;
                (Bytes::from(ct), None)
            }
            DekAlgorithm::AesCtr => {
                let mut buf = plaintext.to_vec();
                dek::ctr_apply_at(material.key.as_ref(), &material.iv, 0, &mut buf)?;
                let tag = hmac_tag(material.key.as_ref(), &buf);
                (Bytes::from(buf), Some(tag.to_vec()))
            }
            DekAlgorithm::None => (Bytes::copy_from_slice(plaintext), None),
        };

        debug!(
            "Encrypted {} bytes -> {} bytes ({}, provider '{}')",
            plaintext.len(),
            ciphertext.len(),
            algorithm,
            active.alias
        );

        let envelope = Envelope {
            kek_provider: active.kind(),
            kek_fingerprint: active.provider.fingerprint().to_vec(),
            provider_alias: active.alias.clone(),
            dek_algorithm: algorithm,
            encrypted_dek,
            iv: material.iv.clone(),
            hmac,
            content_length_plain: Some(plaintext.len() as u64),
        };
        Ok(EncryptedObject {
            ciphertext,
            envelope,
        })
    }

    /// Resolve the wrapping KEK for a stored envelope and unwrap its DEK.
    async fn unwrap_dek(
        &self,
        envelope: &Envelope,
        object_key: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let ring = self.ring.load_full();
        let kek = ring
            .resolve(
                envelope.kek_provider,
                &envelope.kek_fingerprint,
                &envelope.provider_alias,
            )
            .ok_or_else(|| CryptoError::KeyNotFound {
                provider: envelope.kek_provider.name().to_string(),
                fingerprint: hex::encode(&envelope.kek_fingerprint),
            })?;
        kek.provider
            .unwrap_dek(&envelope.encrypted_dek, object_key.as_bytes())
            .await
    }

    /// Decrypt an upstream ciphertext stream back into plaintext.
    ///
    /// CTR payloads are verified through an HMAC tee as they flow; a tag
    /// mismatch surfaces as a terminal stream error even if earlier bytes
    /// were already delivered. GCM payloads are small by construction and
    /// opened in one shot.
    pub async fn decrypt_stream(
        &self,
        ciphertext: BoxStream<'static, Result<Bytes, CryptoError>>,
        envelope: &Envelope,
        object_key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, CryptoError>>, CryptoError> {
        envelope.validate()?;

        match envelope.dek_algorithm {
            DekAlgorithm::None => Ok(ciphertext),
            DekAlgorithm::AesGcm => {
                let dek = self.unwrap_dek(envelope, object_key).await?;
                let buf: Vec<Bytes> = ciphertext.try_collect().await?;
                let ct: Vec<u8> = buf.concat();
                if let Some(ref tag) = envelope.hmac {
                    if !super::hmac::verify_tag(tag, &hmac_tag(dek.as_slice(), &ct)) {
                        return Err(CryptoError::IntegrityFailure);
                    }
                }
                let pt = dek::gcm_open(dek.as_slice(), &envelope.iv, &ct, object_key.as_bytes())?;
                Ok(futures::stream::once(async move { Ok(Bytes::from(pt)) }).boxed())
            }
            DekAlgorithm::AesCtr => {
                let dek = self.unwrap_dek(envelope, object_key).await?;
                let tag = envelope
                    .hmac
                    .clone()
                    .ok_or_else(|| CryptoError::InvalidEnvelope("aes-ctr without hmac".to_string()))?;
                let verified = HmacVerifyStream::new(ciphertext, dek.as_slice(), tag).boxed();
                let plaintext = dek::CtrStream::new(verified, dek.as_slice(), &envelope.iv, 0)?;
                Ok(plaintext.boxed())
            }
        }
    }

    /// Generate the fixed key material for a multipart upload. Multipart is
    /// always CTR (parts must be encryptable at independent offsets), except
    /// under a `none` provider where the whole upload is an identity relay.
    pub async fn begin_multipart(
        &self,
        object_key: &str,
    ) -> Result<MultipartCryptoState, CryptoError> {
        let algorithm = self.effective_algorithm(DekAlgorithm::AesCtr);
        let ring = self.ring.load_full();
        let active = ring.active();
        let material = dek::generate_dek(algorithm);
        let encrypted_dek = active
            .provider
            .wrap(material.key.as_ref(), object_key.as_bytes())
            .await?;
        Ok(MultipartCryptoState {
            dek: material,
            encrypted_dek,
            kek_provider: active.kind(),
            kek_fingerprint: active.provider.fingerprint().to_vec(),
            provider_alias: active.alias.clone(),
        })
    }
}
