//! Multipart upload coordination.
//!
//! Each upload owns a fixed DEK + base IV for its whole life. Part `n`'s
//! CTR keystream starts at the plaintext byte offset where part `n` begins,
//! so parts occupy disjoint counter ranges and the completed object decrypts
//! as one contiguous CTR stream. The rolling HMAC over the ciphertext is
//! folded strictly in part order.
//!
//! Parts arriving in order are encrypted at the exact running offset. An
//! out-of-order part is encrypted at the offset implied by the configured
//! part size, pushed upstream immediately, and its ciphertext is buffered
//! (bounded) until the HMAC accumulator reaches it; the offset assumption is
//! re-checked when the gap closes and any violation fails the upload rather
//! than completing it with a broken keystream.
//!
//! State is ephemeral: a proxy restart strands in-progress uploads and the
//! client (or the TTL sweeper) must abort them upstream.

use crate::crypto::{
    ctr_apply_at, CryptoError, DekAlgorithm, Envelope, MultipartCryptoState, SequentialHmac,
    AES_BLOCK_LEN,
};
use crate::upstream::{ObjectStore, UpstreamError};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Out-of-order parts buffered per upload before the upload is failed.
const MAX_PENDING_PARTS: usize = 16;

/// Errors from the multipart coordinator.
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("NoSuchUpload: {0}")]
    NoSuchUpload(String),

    #[error("Part number must be between 1 and 10000, got {0}")]
    InvalidPartNumber(u32),

    #[error("InvalidPart: {0}")]
    InvalidPart(String),

    #[error("Part {part} was already sealed into the integrity state and cannot be replaced")]
    PartSealed { part: u32 },

    #[error("Too many out-of-order parts in flight (limit {MAX_PENDING_PARTS})")]
    PendingOverflow,

    #[error("Upload can no longer be completed: {0}")]
    NotCompletable(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Summary of one uploaded part, for ListParts.
#[derive(Debug, Clone)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Summary of one in-progress upload, for ListMultipartUploads.
#[derive(Debug, Clone)]
pub struct UploadInfo {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// A part sealed into the sequential HMAC.
struct SealedPart {
    etag: String,
    plaintext_len: u64,
    uploaded_at: DateTime<Utc>,
}

/// An out-of-order part already pushed upstream, waiting for the HMAC
/// accumulator to reach it. Ciphertext is retained only for the HMAC fold.
struct PendingPart {
    etag: String,
    plaintext_len: u64,
    assumed_offset: u64,
    ciphertext: Bytes,
    uploaded_at: DateTime<Utc>,
}

enum Phase {
    Active,
    /// Terminal; kept briefly so a late duplicate request gets a clean error.
    Failed(&'static str),
}

/// State for one in-progress multipart upload. All access is serialized by
/// the per-entry mutex in the table.
struct MultipartUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    user_metadata: HashMap<String, String>,
    crypto: MultipartCryptoState,
    hmac: Option<SequentialHmac>,
    /// Plaintext byte offset where the next sealed part begins.
    next_part_offset: u64,
    /// Next part number the HMAC accumulator will accept.
    expected_part: u32,
    sealed: BTreeMap<u32, SealedPart>,
    pending: BTreeMap<u32, PendingPart>,
    created_at: DateTime<Utc>,
    phase: Phase,
}

impl MultipartUpload {
    fn algorithm(&self) -> DekAlgorithm {
        self.crypto.dek.algorithm
    }

    fn check_active(&self) -> Result<(), MultipartError> {
        match self.phase {
            Phase::Active => Ok(()),
            Phase::Failed(reason) => Err(MultipartError::NotCompletable(reason.to_string())),
        }
    }

    /// Encrypt one part in place at the given plaintext offset.
    fn encrypt_part(&self, offset: u64, plaintext: Bytes) -> Result<Bytes, MultipartError> {
        match self.algorithm() {
            DekAlgorithm::AesCtr => {
                let mut buf = plaintext.to_vec();
                ctr_apply_at(self.crypto.dek.key.as_ref(), &self.crypto.dek.iv, offset, &mut buf)?;
                Ok(Bytes::from(buf))
            }
            _ => Ok(plaintext),
        }
    }

    /// Fold part `n` into the sequential state.
    fn seal(
        &mut self,
        part_number: u32,
        etag: String,
        plaintext_len: u64,
        ciphertext: &[u8],
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), MultipartError> {
        if let Some(hmac) = self.hmac.as_mut() {
            hmac.update_sequential(part_number, ciphertext)?;
        }
        self.sealed.insert(
            part_number,
            SealedPart {
                etag,
                plaintext_len,
                uploaded_at,
            },
        );
        self.next_part_offset += plaintext_len;
        self.expected_part += 1;
        Ok(())
    }

    /// Seal any pending parts that the accumulator has caught up to.
    fn drain_pending(&mut self) -> Result<(), MultipartError> {
        while let Some(pending) = self.pending.remove(&self.expected_part) {
            // The pending part was encrypted under the fixed-part-size offset
            // assumption; the parts sealed since must have ended exactly there.
            if pending.assumed_offset != self.next_part_offset {
                self.phase = Phase::Failed("part offsets diverged from the configured part size");
                return Err(MultipartError::NotCompletable(format!(
                    "part {} was encrypted at offset {} but the preceding parts end at {}",
                    self.expected_part, pending.assumed_offset, self.next_part_offset
                )));
            }
            let part_number = self.expected_part;
            self.seal(
                part_number,
                pending.etag,
                pending.plaintext_len,
                &pending.ciphertext,
                pending.uploaded_at,
            )?;
        }
        Ok(())
    }
}

/// Thread-safe coordinator for all in-progress multipart uploads.
///
/// The table itself is a concurrent map; each entry carries its own async
/// mutex so state mutations for one upload id are serialized while distinct
/// uploads proceed in parallel.
pub struct MultipartTable {
    uploads: DashMap<String, Arc<tokio::sync::Mutex<MultipartUpload>>>,
    store: Arc<dyn ObjectStore>,
    part_size_hint: u64,
}

impl MultipartTable {
    pub fn new(store: Arc<dyn ObjectStore>, part_size_hint: u64) -> Self {
        Self {
            uploads: DashMap::new(),
            store,
            part_size_hint,
        }
    }

    fn entry(&self, upload_id: &str) -> Result<Arc<tokio::sync::Mutex<MultipartUpload>>, MultipartError> {
        self.uploads
            .get(upload_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| MultipartError::NoSuchUpload(upload_id.to_string()))
    }

    /// Begin an upload: allocate upstream state and pin the DEK + base IV for
    /// the upload's lifetime. Returns the upstream upload id, which doubles
    /// as the client-facing id.
    pub async fn create(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        user_metadata: HashMap<String, String>,
        crypto: MultipartCryptoState,
    ) -> Result<String, MultipartError> {
        let upload_id = self
            .store
            .create_multipart(bucket, key, content_type.clone(), user_metadata.clone())
            .await?;

        let hmac = match crypto.dek.algorithm {
            DekAlgorithm::AesCtr => Some(SequentialHmac::new(crypto.dek.key.as_ref())),
            _ => None,
        };

        let upload = MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type,
            user_metadata,
            crypto,
            hmac,
            next_part_offset: 0,
            expected_part: 1,
            sealed: BTreeMap::new(),
            pending: BTreeMap::new(),
            created_at: Utc::now(),
            phase: Phase::Active,
        };

        info!(
            "CreateMultipartUpload {}/{} uploadId={} ({})",
            bucket,
            key,
            upload_id,
            upload.algorithm()
        );
        self.uploads
            .insert(upload_id.clone(), Arc::new(tokio::sync::Mutex::new(upload)));
        Ok(upload_id)
    }

    /// Encrypt and push one part. Returns the upstream part ETag.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        part_number: u32,
        plaintext: Bytes,
    ) -> Result<String, MultipartError> {
        if !(1..=10000).contains(&part_number) {
            return Err(MultipartError::InvalidPartNumber(part_number));
        }

        let entry = self.entry(upload_id)?;
        let mut upload = entry.lock().await;
        upload.check_active()?;

        if upload.bucket != bucket || upload.key != key {
            return Err(MultipartError::NoSuchUpload(upload_id.to_string()));
        }

        if part_number < upload.expected_part {
            return Err(MultipartError::PartSealed { part: part_number });
        }

        let plaintext_len = plaintext.len() as u64;
        let now = Utc::now();

        if part_number == upload.expected_part {
            let offset = upload.next_part_offset;
            let ciphertext = upload.encrypt_part(offset, plaintext)?;
            let etag = self
                .store
                .upload_part(bucket, key, upload_id, part_number, ciphertext.clone())
                .await?;
            upload.seal(part_number, etag.clone(), plaintext_len, &ciphertext, now)?;
            upload.drain_pending()?;
            debug!(
                "UploadPart {}/{} part={} sealed at offset {}",
                bucket, key, part_number, offset
            );
            return Ok(etag);
        }

        // Out-of-order arrival. Encrypt at the offset the configured part
        // size implies; replacement of a still-pending part is allowed.
        if !upload.pending.contains_key(&part_number)
            && upload.pending.len() >= MAX_PENDING_PARTS
        {
            upload.phase = Phase::Failed("out-of-order part buffer overflowed");
            return Err(MultipartError::PendingOverflow);
        }

        let assumed_offset = (part_number as u64 - 1) * self.part_size_hint;
        let ciphertext = upload.encrypt_part(assumed_offset, plaintext)?;
        let etag = self
            .store
            .upload_part(bucket, key, upload_id, part_number, ciphertext.clone())
            .await?;
        upload.pending.insert(
            part_number,
            PendingPart {
                etag: etag.clone(),
                plaintext_len,
                assumed_offset,
                ciphertext,
                uploaded_at: now,
            },
        );
        debug!(
            "UploadPart {}/{} part={} buffered out-of-order at assumed offset {}",
            bucket, key, part_number, assumed_offset
        );
        Ok(etag)
    }

    /// Seal the upload: verify the requested part list against sealed state,
    /// finalize the HMAC, complete upstream, and attach the envelope.
    ///
    /// Envelope metadata is written atomically with the object: when the
    /// metadata attach fails after upstream completion, the completed object
    /// is deleted so no un-enveloped ciphertext survives.
    pub async fn complete(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        requested_parts: &[(u32, String)],
    ) -> Result<(String, Envelope), MultipartError> {
        let entry = self.entry(upload_id)?;
        let mut upload = entry.lock().await;
        upload.check_active()?;

        if upload.bucket != bucket || upload.key != key {
            return Err(MultipartError::NoSuchUpload(upload_id.to_string()));
        }

        if requested_parts.is_empty() {
            return Err(MultipartError::InvalidPart(
                "You must specify at least one part".to_string(),
            ));
        }
        for window in requested_parts.windows(2) {
            if window[0].0 >= window[1].0 {
                return Err(MultipartError::InvalidPart(
                    "Part numbers must be in ascending order".to_string(),
                ));
            }
        }
        if !upload.pending.is_empty() {
            let missing = upload.expected_part;
            return Err(MultipartError::InvalidPart(format!(
                "Part {missing} was never uploaded but later parts were"
            )));
        }

        // The keystream and HMAC cover every sealed part contiguously, so a
        // completion that skips parts would store an object that can never
        // decrypt. Require the requested list to match the sealed set exactly.
        if requested_parts.len() != upload.sealed.len() {
            return Err(MultipartError::InvalidPart(format!(
                "Completion must include all {} uploaded parts",
                upload.sealed.len()
            )));
        }
        let last_part = *upload.sealed.keys().next_back().unwrap_or(&0);
        for (number, requested_etag) in requested_parts {
            let sealed = upload.sealed.get(number).ok_or_else(|| {
                MultipartError::InvalidPart(format!("Part {number} has not been uploaded"))
            })?;
            let requested_clean = requested_etag.trim_matches('"');
            if requested_clean != sealed.etag.trim_matches('"') {
                return Err(MultipartError::InvalidPart(format!(
                    "ETag mismatch for part {number}"
                )));
            }
            // Interior short parts would mis-align every later counter range.
            if *number != last_part && sealed.plaintext_len < AES_BLOCK_LEN {
                return Err(MultipartError::InvalidPart(format!(
                    "Interior part {number} is shorter than one cipher block"
                )));
            }
        }

        let upstream_parts: Vec<(u32, String)> = upload
            .sealed
            .iter()
            .map(|(n, p)| (*n, p.etag.clone()))
            .collect();
        let etag = self
            .store
            .complete_multipart(bucket, key, upload_id, &upstream_parts)
            .await?;

        let tag = upload.hmac.take().map(SequentialHmac::finalize);
        let total_plain = upload.next_part_offset;
        let envelope = upload.crypto.clone_into_envelope(tag, total_plain);

        let mut metadata = crate::crypto::metadata::encode_envelope(&envelope);
        metadata.extend(upload.user_metadata.clone());

        if let Err(e) = self
            .store
            .replace_metadata(bucket, key, upload.content_type.clone(), metadata)
            .await
        {
            warn!(
                "Envelope attach failed for {}/{} after completion, deleting object: {}",
                bucket, key, e
            );
            if let Err(del) = self.store.delete_object(bucket, key).await {
                warn!("Cleanup delete of {}/{} also failed: {}", bucket, key, del);
            }
            upload.phase = Phase::Failed("envelope attach failed; the completed object was removed");
            return Err(e.into());
        }

        info!(
            "CompleteMultipartUpload {}/{} uploadId={} ({} parts, {} bytes plain)",
            bucket,
            key,
            upload_id,
            upstream_parts.len(),
            total_plain
        );

        drop(upload);
        self.uploads.remove(upload_id);
        Ok((etag, envelope))
    }

    /// Abort: propagate upstream, then discard state.
    pub async fn abort(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(), MultipartError> {
        let entry = self.entry(upload_id)?;
        {
            let upload = entry.lock().await;
            if upload.bucket != bucket || upload.key != key {
                return Err(MultipartError::NoSuchUpload(upload_id.to_string()));
            }
        }
        self.store.abort_multipart(bucket, key, upload_id).await?;
        self.uploads.remove(upload_id);
        info!("AbortMultipartUpload {}/{} uploadId={}", bucket, key, upload_id);
        Ok(())
    }

    /// List sealed and pending parts for an upload.
    pub async fn list_parts(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<PartInfo>, MultipartError> {
        let entry = self.entry(upload_id)?;
        let upload = entry.lock().await;
        if upload.bucket != bucket || upload.key != key {
            return Err(MultipartError::NoSuchUpload(upload_id.to_string()));
        }

        let mut parts: Vec<PartInfo> = upload
            .sealed
            .iter()
            .map(|(&number, p)| PartInfo {
                part_number: number,
                etag: p.etag.clone(),
                size: p.plaintext_len,
                last_modified: p.uploaded_at,
            })
            .chain(upload.pending.iter().map(|(&number, p)| PartInfo {
                part_number: number,
                etag: p.etag.clone(),
                size: p.plaintext_len,
                last_modified: p.uploaded_at,
            }))
            .collect();
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    /// List uploads, optionally filtered by bucket and key prefix.
    pub async fn list_uploads(&self, bucket: Option<&str>, prefix: Option<&str>) -> Vec<UploadInfo> {
        let mut result = Vec::new();
        for entry in self.uploads.iter() {
            let upload = entry.value().lock().await;
            if let Some(b) = bucket {
                if upload.bucket != b {
                    continue;
                }
            }
            if let Some(p) = prefix {
                if !upload.key.starts_with(p) {
                    continue;
                }
            }
            result.push(UploadInfo {
                key: upload.key.clone(),
                upload_id: entry.key().clone(),
                initiated: upload.created_at,
            });
        }
        result.sort_by(|a, b| a.key.cmp(&b.key).then(a.upload_id.cmp(&b.upload_id)));
        result
    }

    /// Abort uploads older than `max_age` upstream and drop their state.
    /// Run periodically; a crashed client never completes or aborts.
    pub async fn cleanup_expired(&self, max_age: std::time::Duration) {
        let cutoff = Utc::now() - Duration::from_std(max_age).unwrap_or(Duration::hours(24));
        let mut expired = Vec::new();
        for entry in self.uploads.iter() {
            let upload = entry.value().lock().await;
            if upload.created_at <= cutoff {
                expired.push((entry.key().clone(), upload.bucket.clone(), upload.key.clone()));
            }
        }
        for (upload_id, bucket, key) in expired {
            warn!(
                "Evicting abandoned multipart upload {}/{} uploadId={}",
                bucket, key, upload_id
            );
            if let Err(e) = self.store.abort_multipart(&bucket, &key, &upload_id).await {
                warn!("Upstream abort for expired upload {} failed: {}", upload_id, e);
            }
            self.uploads.remove(&upload_id);
        }
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }
}
