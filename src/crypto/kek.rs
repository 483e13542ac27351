//! Key-Encryption-Key providers and the hot-swappable provider ring.
//!
//! Providers wrap and unwrap per-object DEKs. Several providers may be
//! loaded at once, keyed by alias; exactly one alias is "active" and used
//! for writes, while any loaded provider may service reads whose stored
//! fingerprint matches. Swapping the ring (via `arc-swap` at the call site)
//! rotates keys without rewriting data.

use super::{CryptoError, DEK_LEN, GCM_NONCE_LEN};
use crate::config::{EncryptionConfig, ProviderConfig};
use crate::license::LicenseGate;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Truncated-fingerprint length for symmetric KEKs.
pub const KEK_FINGERPRINT_LEN: usize = 8;

/// Provider type tags as they appear in configuration and stored envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aes,
    Rsa,
    Tink,
    None,
}

impl ProviderKind {
    /// Wire name stored in `s3ep-kek-provider`.
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Aes => "aes",
            ProviderKind::Rsa => "rsa",
            ProviderKind::Tink => "tink",
            ProviderKind::None => "none",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "aes" => Some(ProviderKind::Aes),
            "rsa" => Some(ProviderKind::Rsa),
            "tink" => Some(ProviderKind::Tink),
            "none" => Some(ProviderKind::None),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A KEK provider variant. Kept as a tagged enum rather than a trait object:
/// the capability set is closed and `wrap`/`unwrap` need to be async only for
/// the KMS-delegated variant.
pub enum KekProvider {
    Aes(AesKek),
    Rsa(RsaKek),
    Tink(TinkKek),
    None,
}

impl KekProvider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            KekProvider::Aes(_) => ProviderKind::Aes,
            KekProvider::Rsa(_) => ProviderKind::Rsa,
            KekProvider::Tink(_) => ProviderKind::Tink,
            KekProvider::None => ProviderKind::None,
        }
    }

    /// Wrap a freshly generated DEK. `aad` binds the wrapping to the object key.
    pub async fn wrap(&self, dek: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            KekProvider::Aes(k) => k.wrap(dek, aad),
            KekProvider::Rsa(k) => k.wrap(dek, aad),
            KekProvider::Tink(k) => k.wrap(dek, aad).await,
            KekProvider::None => Ok(Vec::new()),
        }
    }

    /// Unwrap a stored DEK. `aad` must match the value used at wrap time.
    pub async fn unwrap_dek(&self, encrypted_dek: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self {
            KekProvider::Aes(k) => k.unwrap_dek(encrypted_dek, aad),
            KekProvider::Rsa(k) => k.unwrap_dek(encrypted_dek, aad),
            KekProvider::Tink(k) => k.unwrap_dek(encrypted_dek, aad).await,
            KekProvider::None => Ok(Zeroizing::new(Vec::new())),
        }
    }

    /// Short, non-reversible identifier of this KEK for lookup at decrypt time.
    pub fn fingerprint(&self) -> &[u8] {
        match self {
            KekProvider::Aes(k) => &k.fingerprint,
            KekProvider::Rsa(k) => &k.fingerprint,
            KekProvider::Tink(k) => &k.fingerprint,
            KekProvider::None => &[],
        }
    }

    /// Startup self-check: wrap and unwrap a throwaway DEK so broken key
    /// material fails the process before it can strand objects.
    pub async fn validate_self(&self) -> Result<(), CryptoError> {
        let mut probe = Zeroizing::new([0u8; DEK_LEN]);
        OsRng.fill_bytes(probe.as_mut());
        let wrapped = self.wrap(probe.as_ref(), b"validate-self").await?;
        let unwrapped = self.unwrap_dek(&wrapped, b"validate-self").await?;
        match self {
            KekProvider::None => Ok(()),
            KekProvider::Rsa(k) if k.private.is_none() => {
                // Write-only provider: unwrap legitimately unavailable.
                Ok(())
            }
            _ if unwrapped.as_slice() == probe.as_ref() => Ok(()),
            _ => Err(CryptoError::InvalidKey(
                "KEK self-check round-trip mismatch".to_string(),
            )),
        }
    }
}

/// 256-bit symmetric KEK held in process memory. Wraps DEKs with AES-GCM,
/// AAD bound to the object key; the random nonce is prepended to the result.
pub struct AesKek {
    key: Zeroizing<[u8; 32]>,
    fingerprint: Vec<u8>,
}

impl AesKek {
    pub fn new(key: [u8; 32]) -> Self {
        // Fingerprint = truncated SHA-256 of the raw KEK bytes.
        let fingerprint = Sha256::digest(key)[..KEK_FINGERPRINT_LEN].to_vec();
        Self {
            key: Zeroizing::new(key),
            fingerprint,
        }
    }

    fn wrap(&self, dek: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|_| CryptoError::InvalidKey("AES KEK must be 32 bytes".to_string()))?;
        let mut nonce = [0u8; GCM_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: dek, aad })
            .map_err(|_| CryptoError::WrapFailed("AES-GCM wrap failed".to_string()))?;
        let mut out = Vec::with_capacity(GCM_NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn unwrap_dek(&self, encrypted_dek: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if encrypted_dek.len() <= GCM_NONCE_LEN {
            return Err(CryptoError::UnwrapFailed(
                "wrapped DEK too short".to_string(),
            ));
        }
        let (nonce, ct) = encrypted_dek.split_at(GCM_NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|_| CryptoError::InvalidKey("AES KEK must be 32 bytes".to_string()))?;
        let pt = cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad })
            .map_err(|_| CryptoError::UnwrapFailed("AES-GCM unwrap rejected".to_string()))?;
        Ok(Zeroizing::new(pt))
    }
}

/// RSA-OAEP(SHA-256) KEK. The public half wraps; unwrap requires the private
/// half, so a write-only deployment can hold the public key alone.
pub struct RsaKek {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
    fingerprint: Vec<u8>,
}

impl RsaKek {
    pub fn new(public: RsaPublicKey, private: Option<RsaPrivateKey>) -> Result<Self, CryptoError> {
        // Fingerprint = SHA-256 of the DER-encoded public key (SPKI).
        let der = public
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(format!("cannot encode RSA public key: {e}")))?;
        let fingerprint = Sha256::digest(der.as_bytes()).to_vec();
        Ok(Self {
            public,
            private,
            fingerprint,
        })
    }

    /// Load from PEM strings. The private key may be PKCS#8 or PKCS#1.
    pub fn from_pem(public_pem: &str, private_pem: Option<&str>) -> Result<Self, CryptoError> {
        let public = RsaPublicKey::from_public_key_pem(public_pem)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid RSA public key PEM: {e}")))?;
        let private = match private_pem {
            Some(pem) => Some(
                RsaPrivateKey::from_pkcs8_pem(pem)
                    .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                    .map_err(|e| {
                        CryptoError::InvalidKey(format!("invalid RSA private key PEM: {e}"))
                    })?,
            ),
            None => None,
        };
        Self::new(public, private)
    }

    fn wrap(&self, dek: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let label = String::from_utf8_lossy(aad).into_owned();
        let padding = Oaep::new_with_label::<Sha256, _>(label);
        self.public
            .encrypt(&mut OsRng, padding, dek)
            .map_err(|e| CryptoError::WrapFailed(format!("RSA-OAEP wrap failed: {e}")))
    }

    fn unwrap_dek(&self, encrypted_dek: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let private = self.private.as_ref().ok_or_else(|| {
            CryptoError::InvalidKey("RSA provider has no private key loaded".to_string())
        })?;
        let label = String::from_utf8_lossy(aad).into_owned();
        let padding = Oaep::new_with_label::<Sha256, _>(label);
        let pt = private
            .decrypt(padding, encrypted_dek)
            .map_err(|_| CryptoError::UnwrapFailed("RSA-OAEP unwrap rejected".to_string()))?;
        Ok(Zeroizing::new(pt))
    }
}

/// KMS-delegated KEK (Tink-style). Wrap and unwrap are remote calls against
/// the configured key URI; the proxy never sees the KEK material.
pub struct TinkKek {
    key_uri: String,
    endpoint: String,
    http: reqwest::Client,
    fingerprint: Vec<u8>,
}

#[derive(Serialize)]
struct KmsRequest<'a> {
    key_uri: &'a str,
    payload: String,
    aad: String,
}

#[derive(Deserialize)]
struct KmsResponse {
    payload: String,
}

impl TinkKek {
    pub fn new(key_uri: String, endpoint: String) -> Self {
        // Fingerprint derived from the remote key reference, not key material.
        let fingerprint = Sha256::digest(key_uri.as_bytes()).to_vec();
        Self {
            key_uri,
            endpoint,
            http: reqwest::Client::new(),
            fingerprint,
        }
    }

    async fn call(&self, op: &str, payload: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD;
        let request = KmsRequest {
            key_uri: &self.key_uri,
            payload: b64.encode(payload),
            aad: b64.encode(aad),
        };
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), op);
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CryptoError::KmsUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CryptoError::KmsUnavailable(format!(
                "KMS {} returned {}",
                op,
                response.status()
            )));
        }
        let body: KmsResponse = response
            .json()
            .await
            .map_err(|e| CryptoError::KmsUnavailable(e.to_string()))?;
        b64.decode(body.payload)
            .map_err(|e| CryptoError::UnwrapFailed(format!("KMS payload not base64: {e}")))
    }

    async fn wrap(&self, dek: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.call("encrypt", dek, aad).await
    }

    async fn unwrap_dek(&self, encrypted_dek: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        Ok(Zeroizing::new(self.call("decrypt", encrypted_dek, aad).await?))
    }
}

/// A provider loaded under an alias.
pub struct LoadedKek {
    pub alias: String,
    pub provider: KekProvider,
}

impl LoadedKek {
    pub fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }
}

/// The loaded provider set: alias → provider, plus the active write alias.
/// Read-mostly after initialization; rotation replaces the whole ring
/// atomically through `ArcSwap` at the application-state level.
pub struct KekRing {
    providers: HashMap<String, LoadedKek>,
    active_alias: String,
}

impl KekRing {
    /// Build the ring from configuration, enforcing the license gate on every
    /// provider type before any key material is loaded.
    pub fn from_config(config: &EncryptionConfig, gate: &LicenseGate) -> Result<Self, CryptoError> {
        use base64::Engine as _;
        let mut providers = HashMap::new();

        for pc in &config.providers {
            let (alias, provider) = match pc {
                ProviderConfig::Aes { alias, key_base64 } => {
                    gate.check(ProviderKind::Aes)?;
                    let raw = base64::engine::general_purpose::STANDARD
                        .decode(key_base64)
                        .map_err(|e| {
                            CryptoError::InvalidKey(format!("provider '{alias}': key not base64: {e}"))
                        })?;
                    let key: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                        CryptoError::InvalidKey(format!(
                            "provider '{alias}': AES KEK must be 32 bytes, got {}",
                            raw.len()
                        ))
                    })?;
                    (alias.clone(), KekProvider::Aes(AesKek::new(key)))
                }
                ProviderConfig::Rsa {
                    alias,
                    public_key_path,
                    private_key_path,
                } => {
                    gate.check(ProviderKind::Rsa)?;
                    let public_pem = std::fs::read_to_string(public_key_path).map_err(|e| {
                        CryptoError::InvalidKey(format!(
                            "provider '{alias}': cannot read {public_key_path}: {e}"
                        ))
                    })?;
                    let private_pem = match private_key_path {
                        Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                            CryptoError::InvalidKey(format!(
                                "provider '{alias}': cannot read {path}: {e}"
                            ))
                        })?),
                        None => None,
                    };
                    (
                        alias.clone(),
                        KekProvider::Rsa(RsaKek::from_pem(&public_pem, private_pem.as_deref())?),
                    )
                }
                ProviderConfig::Tink {
                    alias,
                    key_uri,
                    endpoint,
                } => {
                    gate.check(ProviderKind::Tink)?;
                    (
                        alias.clone(),
                        KekProvider::Tink(TinkKek::new(key_uri.clone(), endpoint.clone())),
                    )
                }
                ProviderConfig::None { alias } => (alias.clone(), KekProvider::None),
            };

            debug!(
                "Loaded KEK provider '{}' ({}) fingerprint {}",
                alias,
                provider.kind(),
                hex::encode(provider.fingerprint())
            );

            if providers
                .insert(alias.clone(), LoadedKek { alias: alias.clone(), provider })
                .is_some()
            {
                return Err(CryptoError::InvalidKey(format!(
                    "duplicate provider alias '{alias}'"
                )));
            }
        }

        if !providers.contains_key(&config.active_alias) {
            return Err(CryptoError::InvalidKey(format!(
                "active_alias '{}' is not a configured provider",
                config.active_alias
            )));
        }

        info!(
            "KEK ring loaded: {} provider(s), active alias '{}'",
            providers.len(),
            config.active_alias
        );

        Ok(Self {
            providers,
            active_alias: config.active_alias.clone(),
        })
    }

    /// Build a ring directly from loaded providers (tests, rotation tooling).
    pub fn new(providers: Vec<LoadedKek>, active_alias: String) -> Result<Self, CryptoError> {
        let map: HashMap<String, LoadedKek> = providers
            .into_iter()
            .map(|p| (p.alias.clone(), p))
            .collect();
        if !map.contains_key(&active_alias) {
            return Err(CryptoError::InvalidKey(format!(
                "active_alias '{active_alias}' is not a loaded provider"
            )));
        }
        Ok(Self {
            providers: map,
            active_alias,
        })
    }

    /// The provider used for new writes.
    pub fn active(&self) -> &LoadedKek {
        // Construction guarantees the active alias resolves.
        &self.providers[&self.active_alias]
    }

    pub fn active_alias(&self) -> &str {
        &self.active_alias
    }

    /// Resolve a provider for decryption by the `(provider, fingerprint)`
    /// pair stored on the object. The stored alias is tried first (cheap,
    /// and correct across rotations that keep aliases stable); fall back to
    /// scanning every loaded provider of the right type.
    pub fn resolve(&self, kind: ProviderKind, fingerprint: &[u8], alias_hint: &str) -> Option<&LoadedKek> {
        if let Some(k) = self.providers.get(alias_hint) {
            if k.kind() == kind && k.provider.fingerprint() == fingerprint {
                return Some(k);
            }
        }
        self.providers
            .values()
            .find(|k| k.kind() == kind && k.provider.fingerprint() == fingerprint)
    }

    /// Run every provider's self-check. Called once at startup.
    pub async fn validate_all(&self) -> Result<(), CryptoError> {
        for k in self.providers.values() {
            k.provider.validate_self().await.map_err(|e| {
                CryptoError::InvalidKey(format!("provider '{}' failed self-check: {e}", k.alias))
            })?;
        }
        Ok(())
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(|s| s.as_str())
    }
}
