//! S3 API request handlers
//!
//! Split into submodules by domain:
//! - `object` — the encrypting data path: GET, HEAD, PUT, DELETE
//! - `multipart` — multipart upload lifecycle
//! - `passthrough` — verbatim forwarding for every other S3 verb
//! - `status` — health endpoint

mod multipart;
mod object;
mod passthrough;
mod status;

use super::errors::S3Error;
use crate::crypto::metadata::meta_keys;
use crate::crypto::{Envelope, EnvelopeEngine};
use crate::multipart::MultipartTable;
use crate::shutdown::{RequestTicket, ShutdownSupervisor};
use crate::upstream::{Forwarder, ObjectHead, ObjectStore};
use axum::http::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::Arc;

// Re-export all public handlers so the router doesn't reach into submodules.
pub use multipart::post_object;
pub use object::{delete_object, get_object, head_object, put_object_or_copy};
pub use passthrough::{bucket_handler, passthrough, root_handler};
pub use status::{health_check, HealthResponse};

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub engine: EnvelopeEngine,
    pub multipart: Arc<MultipartTable>,
    pub forwarder: Arc<Forwarder>,
    pub supervisor: Arc<ShutdownSupervisor>,
    /// Objects at or above this size (or with unknown length) use CTR+HMAC.
    pub streaming_threshold: u64,
    /// Upper bound for buffered request bodies.
    pub max_object_size: u64,
}

impl AppState {
    /// Acquire an in-flight ticket, or refuse the request while draining.
    pub fn ticket(&self) -> Result<RequestTicket, S3Error> {
        self.supervisor
            .on_request_start()
            .ok_or(S3Error::ShuttingDown)
    }
}

/// Query parameters for object-level operations (multipart upload)
#[derive(Debug, serde::Deserialize, Default)]
pub struct ObjectQuery {
    /// CreateMultipartUpload (POST with ?uploads)
    pub uploads: Option<String>,
    /// UploadPart / CompleteMultipartUpload (with ?uploadId)
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    /// UploadPart (PUT with ?partNumber)
    #[serde(rename = "partNumber")]
    pub part_number: Option<u32>,
}

// ---------------------------------------------------------------------------
// Shared utility functions used across handler submodules
// ---------------------------------------------------------------------------

/// Query keys the object data path understands; any other key names an S3
/// subresource (acl, tagging, torrent, ...) that is forwarded verbatim.
const DATA_PATH_QUERY_KEYS: &[&str] = &["uploads", "uploadId", "partNumber"];

/// Whether a raw query string contains subresource keys the data path does
/// not terminate. `response-*` keys only shape response headers and stay on
/// the data path.
pub(crate) fn has_passthrough_subresource(query: &str) -> bool {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| pair.split_once('=').map(|(k, _)| k).unwrap_or(pair))
        .any(|key| !DATA_PATH_QUERY_KEYS.contains(&key) && !key.starts_with("response-"))
}

fn hval(s: &str) -> HeaderValue {
    HeaderValue::from_bytes(s.as_bytes()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Extract user-provided `x-amz-meta-*` headers as bare keys.
///
/// Keys colliding with the reserved envelope namespace are rejected outright
/// so a client can never forge or shadow envelope fields.
pub(crate) fn extract_user_metadata(
    headers: &HeaderMap,
) -> Result<HashMap<String, String>, S3Error> {
    let mut metadata = HashMap::new();
    for (name, value) in headers {
        let name_str = name.as_str();
        if let Some(bare) = name_str.strip_prefix(meta_keys::AMZ_META_PREFIX) {
            if crate::crypto::metadata::is_envelope_key(bare) {
                return Err(S3Error::MalformedRequest(format!(
                    "metadata key '{bare}' uses the reserved '{}' prefix",
                    meta_keys::PREFIX
                )));
            }
            if let Ok(v) = value.to_str() {
                metadata.insert(bare.to_string(), v.to_string());
            }
        }
    }
    Ok(metadata)
}

/// Build client-facing response headers for an object.
///
/// Envelope fields never leave the proxy; `Content-Length` is rewritten to
/// the plaintext length for encrypted objects.
pub(crate) fn build_object_headers(head: &ObjectHead, envelope: Option<&Envelope>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let content_length = plaintext_length(head, envelope);
    headers.insert("Content-Length", hval(&content_length.to_string()));

    let content_type = head
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    headers.insert("Content-Type", hval(&content_type));

    if let Some(ref etag) = head.etag {
        headers.insert("ETag", hval(etag));
    }
    if let Some(last_modified) = head.last_modified {
        headers.insert(
            "Last-Modified",
            hval(&last_modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
        );
    }

    // User metadata minus the envelope namespace.
    for (key, value) in &head.metadata {
        if crate::crypto::metadata::is_envelope_key(key) {
            continue;
        }
        let header_name = format!("{}{}", meta_keys::AMZ_META_PREFIX, key);
        if let Ok(name) = axum::http::header::HeaderName::from_bytes(header_name.as_bytes()) {
            headers.insert(name, hval(value));
        }
    }

    headers
}

/// The length the client sees: decoded payload length for encrypted objects,
/// stored length otherwise.
pub(crate) fn plaintext_length(head: &ObjectHead, envelope: Option<&Envelope>) -> u64 {
    match envelope {
        Some(env) => env.content_length_plain.unwrap_or_else(|| {
            match env.dek_algorithm {
                // GCM appends a 16-byte tag to the stored ciphertext.
                crate::crypto::DekAlgorithm::AesGcm => {
                    head.content_length.saturating_sub(crate::crypto::GCM_TAG_LEN as u64)
                }
                _ => head.content_length,
            }
        }),
        None => head.content_length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DekAlgorithm, ProviderKind};

    fn head_with(metadata: &[(&str, &str)], content_length: u64) -> ObjectHead {
        ObjectHead {
            content_length,
            content_type: Some("application/octet-stream".to_string()),
            etag: Some("\"abc\"".to_string()),
            last_modified: None,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_subresource_detection() {
        assert!(!has_passthrough_subresource(""));
        assert!(!has_passthrough_subresource("uploadId=abc&partNumber=2"));
        assert!(!has_passthrough_subresource("uploads"));
        assert!(!has_passthrough_subresource("response-content-type=text%2Fplain"));
        assert!(has_passthrough_subresource("acl"));
        assert!(has_passthrough_subresource("tagging"));
        assert!(has_passthrough_subresource("uploadId=abc&legal-hold"));
    }

    #[test]
    fn test_extract_user_metadata_rejects_reserved() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-meta-owner", "alice".parse().unwrap());
        let meta = extract_user_metadata(&headers).unwrap();
        assert_eq!(meta["owner"], "alice");

        headers.insert("x-amz-meta-s3ep-hmac", "forged".parse().unwrap());
        assert!(matches!(
            extract_user_metadata(&headers),
            Err(S3Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_object_headers_strip_envelope_fields() {
        let head = head_with(
            &[
                ("s3ep-dek-algorithm", "aes-ctr"),
                ("s3ep-hmac", "dGFn"),
                ("color", "blue"),
            ],
            1024,
        );
        let headers = build_object_headers(&head, None);
        assert!(headers.get("x-amz-meta-s3ep-dek-algorithm").is_none());
        assert!(headers.get("x-amz-meta-s3ep-hmac").is_none());
        assert_eq!(headers.get("x-amz-meta-color").unwrap(), "blue");
    }

    #[test]
    fn test_plaintext_length_rewrite() {
        let head = head_with(&[], 1040);
        let envelope = Envelope {
            kek_provider: ProviderKind::Aes,
            kek_fingerprint: vec![0; 8],
            provider_alias: "k1".to_string(),
            dek_algorithm: DekAlgorithm::AesGcm,
            encrypted_dek: vec![1; 40],
            iv: vec![0; 12],
            hmac: None,
            content_length_plain: Some(1024),
        };
        assert_eq!(plaintext_length(&head, Some(&envelope)), 1024);
        assert_eq!(plaintext_length(&head, None), 1040);

        // Without the explicit field, GCM falls back to stored minus tag.
        let mut envelope = envelope;
        envelope.content_length_plain = None;
        assert_eq!(plaintext_length(&head, Some(&envelope)), 1024);
    }
}
