//! Object-level S3 handlers: the encrypting PUT/GET data path, HEAD with
//! envelope stripping, DELETE, and copy-with-re-encryption.

use super::{
    build_object_headers, extract_user_metadata, has_passthrough_subresource, plaintext_length,
    AppState, ObjectQuery, S3Error,
};
use crate::api::aws_chunked::{
    get_decoded_content_length, is_aws_chunked, AwsChunkedStream, ChunkedError,
};
use crate::api::extractors::ValidatedPath;
use crate::api::xml::{CopyObjectResult, ListPartsResult};
use crate::crypto::{metadata as envmeta, CryptoError, DekAlgorithm};
use axum::body::{Body, Bytes};
use axum::extract::{Query, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Content-type marker forcing the streaming CTR path regardless of size.
/// Used for uploads whose final size is unknown up front.
pub const FORCE_CTR_CONTENT_TYPE: &str = "application/x-s3ep-force-aes-ctr";

/// Buffer the request body, stripping AWS-chunked framing on the wire when
/// the request advertises it. The decoder is a stream filter, so framing
/// never reaches the encryption stage and at most one chunk is held by the
/// decoder itself; the assembled payload is still bounded by
/// `max_object_size`.
async fn collect_body(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<Bytes, S3Error> {
    let raw = body
        .into_data_stream()
        .map_err(|e| ChunkedError::Stream(e.to_string()))
        .boxed();

    let mut stream = if is_aws_chunked(headers) {
        let expected = get_decoded_content_length(headers);
        debug!("Decoding AWS chunked payload, expected decoded: {:?}", expected);
        AwsChunkedStream::new(raw, expected).boxed()
    } else {
        raw
    };

    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| match e {
            ChunkedError::Stream(msg) => S3Error::InternalError(msg),
            other => S3Error::MalformedRequest(other.to_string()),
        })?;
        if (buf.len() + chunk.len()) as u64 > state.max_object_size {
            return Err(S3Error::EntityTooLarge {
                size: (buf.len() + chunk.len()) as u64,
                max: state.max_object_size,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Select the DEK algorithm for a simple PUT.
fn select_algorithm(state: &AppState, content_type: Option<&str>, payload_len: u64) -> DekAlgorithm {
    if content_type == Some(FORCE_CTR_CONTENT_TYPE) {
        return DekAlgorithm::AesCtr;
    }
    if payload_len >= state.streaming_threshold {
        DekAlgorithm::AesCtr
    } else {
        DekAlgorithm::AesGcm
    }
}

/// PUT object handler (internal)
/// Called by put_object_or_copy after validation
#[instrument(skip(state, headers, payload))]
async fn put_object_inner(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    payload: Bytes,
) -> Result<Response, S3Error> {
    info!("PUT {}/{} ({} bytes)", bucket, key, payload.len());

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let user_metadata = extract_user_metadata(headers)?;

    // S3 directory marker: zero-byte object with trailing slash (e.g. "folder/").
    // Console clients create these as "folders"; an envelope on an empty
    // marker only confuses them, so it is relayed as-is.
    if key.ends_with('/') && payload.is_empty() {
        info!("Creating directory marker: {}/{}", bucket, key);
        let etag = state
            .store
            .put_object(bucket, key, payload, content_type, user_metadata)
            .await?;
        return Ok((StatusCode::OK, [("ETag", etag)], "").into_response());
    }

    let algorithm = select_algorithm(state, content_type.as_deref(), payload.len() as u64);
    let object_key = format!("{bucket}/{key}");
    let encrypted = state
        .engine
        .encrypt(&payload, &object_key, algorithm)
        .await?;

    let mut metadata = envmeta::encode_envelope(&encrypted.envelope);
    metadata.extend(user_metadata);

    debug!(
        "Storing {}/{} as {} ({} -> {} bytes)",
        bucket,
        key,
        encrypted.envelope.dek_algorithm,
        payload.len(),
        encrypted.ciphertext.len()
    );

    // Metadata rides the same request as the body: either both land or the
    // upload fails with no partial state retained.
    let etag = state
        .store
        .put_object(bucket, key, encrypted.ciphertext, content_type, metadata)
        .await?;

    Ok((StatusCode::OK, [("ETag", etag)], "").into_response())
}

/// COPY object handler (internal)
///
/// Ciphertext can never be byte-copied between keys: the DEK is per-object
/// and the AAD binds it to the source key. Copy decrypts through the engine
/// and re-encrypts under a fresh DEK for the destination.
#[instrument(skip(state, headers))]
async fn copy_object_inner(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let copy_source = headers
        .get("x-amz-copy-source")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| S3Error::MalformedRequest("Missing x-amz-copy-source header".to_string()))?;

    let copy_source = urlencoding::decode(copy_source)
        .map_err(|_| S3Error::InvalidArgument("Invalid copy source encoding".to_string()))?;
    let copy_source = copy_source.trim_start_matches('/');

    let (source_bucket, source_key) = copy_source
        .split_once('/')
        .ok_or_else(|| S3Error::InvalidArgument("Copy source must be bucket/key".to_string()))?;

    info!("COPY {}/{} -> {}/{}", source_bucket, source_key, bucket, key);

    let plaintext = fetch_plaintext(state, source_bucket, source_key).await?;
    let source_head = state.store.head_object(source_bucket, source_key).await?;

    // Metadata directive: COPY (default) carries the source's client
    // metadata; REPLACE takes this request's.
    let directive = headers
        .get("x-amz-metadata-directive")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("COPY");
    let user_metadata: HashMap<String, String> = if directive.eq_ignore_ascii_case("REPLACE") {
        extract_user_metadata(headers)?
    } else {
        source_head
            .metadata
            .iter()
            .filter(|(k, _)| !envmeta::is_envelope_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };

    let content_type = source_head.content_type.clone();
    let algorithm = select_algorithm(state, content_type.as_deref(), plaintext.len() as u64);
    let object_key = format!("{bucket}/{key}");
    let encrypted = state
        .engine
        .encrypt(&plaintext, &object_key, algorithm)
        .await?;

    let mut metadata = envmeta::encode_envelope(&encrypted.envelope);
    metadata.extend(user_metadata);

    let etag = state
        .store
        .put_object(bucket, key, encrypted.ciphertext, content_type, metadata)
        .await?;

    let xml = CopyObjectResult {
        etag,
        last_modified: chrono::Utc::now(),
    }
    .to_xml();
    Ok((StatusCode::OK, [("Content-Type", "application/xml")], xml).into_response())
}

/// Fetch and decrypt a whole object into memory (copy path only).
async fn fetch_plaintext(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
) -> Result<Bytes, S3Error> {
    let object = state.store.get_object(bucket, key).await?;
    let envelope = envmeta::decode_envelope(&object.head.metadata)?;
    let expected_len = plaintext_length(&object.head, envelope.as_ref());
    if expected_len > state.max_object_size {
        return Err(S3Error::EntityTooLarge {
            size: expected_len,
            max: state.max_object_size,
        });
    }

    let ciphertext_stream = object
        .stream
        .map_err(|e| CryptoError::Stream(e.to_string()))
        .boxed();
    let plaintext_stream = match envelope {
        Some(ref env) => {
            let object_key = format!("{bucket}/{key}");
            state
                .engine
                .decrypt_stream(ciphertext_stream, env, &object_key)
                .await?
        }
        None => ciphertext_stream,
    };

    let chunks: Vec<Bytes> = plaintext_stream.try_collect().await.map_err(S3Error::from)?;
    Ok(Bytes::from(chunks.concat()))
}

/// PUT object handler with copy detection and multipart upload support
/// PUT /{bucket}/{key}
/// Detects x-amz-copy-source header to dispatch to copy operation
/// Detects ?partNumber&uploadId for multipart upload part
#[instrument(skip(state, headers, body))]
pub async fn put_object_or_copy(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    // Subresource PUTs (?acl, ?tagging, ...) are not object data.
    if has_passthrough_subresource(raw_query.as_deref().unwrap_or("")) {
        return super::passthrough::forward_request(
            &state,
            Method::PUT,
            &format!("/{bucket}/{key}"),
            raw_query.as_deref().unwrap_or(""),
            &headers,
            body,
        )
        .await;
    }

    let _ticket = state.ticket()?;
    let payload = collect_body(&state, &headers, body).await?;

    // UploadPart
    if let (Some(part_number), Some(upload_id)) = (query.part_number, &query.upload_id) {
        info!(
            "UploadPart {}/{} part={} uploadId={}",
            bucket, key, part_number, upload_id
        );
        let etag = state
            .multipart
            .upload_part(upload_id, &bucket, &key, part_number, payload)
            .await?;
        return Ok((StatusCode::OK, [("ETag", etag)], "").into_response());
    }

    // One of the pair without the other is not a valid S3 request.
    if query.part_number.is_some() != query.upload_id.is_some() {
        return Err(S3Error::MalformedRequest(
            "partNumber and uploadId must be supplied together".to_string(),
        ));
    }

    if headers.contains_key("x-amz-copy-source") {
        copy_object_inner(&state, &bucket, &key, &headers).await
    } else {
        put_object_inner(&state, &bucket, &key, &headers, payload).await
    }
}

/// GET object handler
/// GET /{bucket}/{key}
/// GET /{bucket}/{key}?uploadId=X - ListParts
///
/// Encrypted objects are decrypted on the wire: the upstream ciphertext
/// stream flows through the HMAC tee and the CTR keystream straight into
/// the response body, so memory stays flat regardless of object size.
#[instrument(skip(state, headers))]
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    if has_passthrough_subresource(raw_query.as_deref().unwrap_or("")) {
        return super::passthrough::forward_request(
            &state,
            Method::GET,
            &format!("/{bucket}/{key}"),
            raw_query.as_deref().unwrap_or(""),
            &headers,
            Body::empty(),
        )
        .await;
    }

    // ListParts
    if let Some(upload_id) = &query.upload_id {
        info!("ListParts {}/{} uploadId={}", bucket, key, upload_id);
        let parts = state.multipart.list_parts(upload_id, &bucket, &key).await?;
        let result = ListPartsResult {
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
            parts,
            max_parts: 1000,
            is_truncated: false,
        };
        return Ok((
            StatusCode::OK,
            [("Content-Type", "application/xml")],
            result.to_xml(),
        )
            .into_response());
    }

    let _ticket = state.ticket()?;
    info!("GET {}/{}", bucket, key);

    // Range (and partNumber reads) cannot slice a CTR+HMAC stream: the HMAC
    // covers the whole ciphertext. Unencrypted objects forward untouched.
    let wants_range = headers.contains_key("range") || query.part_number.is_some();
    if wants_range {
        let head = state.store.head_object(&bucket, &key).await?;
        if envmeta::decode_envelope(&head.metadata)?.is_some() {
            return Err(S3Error::NotImplemented(
                "Range requests are not supported for encrypted objects".to_string(),
            ));
        }
        return super::passthrough::forward_request(
            &state,
            Method::GET,
            &format!("/{bucket}/{key}"),
            raw_query.as_deref().unwrap_or(""),
            &headers,
            Body::empty(),
        )
        .await;
    }

    let object = state.store.get_object(&bucket, &key).await?;
    let envelope = envmeta::decode_envelope(&object.head.metadata)?;
    let response_headers = build_object_headers(&object.head, envelope.as_ref());

    let ciphertext_stream = object
        .stream
        .map_err(|e| CryptoError::Stream(e.to_string()))
        .boxed();

    let body = match envelope {
        Some(ref env) => {
            debug!("Decrypting {}/{} ({})", bucket, key, env.dek_algorithm);
            let object_key = format!("{bucket}/{key}");
            let plaintext = state
                .engine
                .decrypt_stream(ciphertext_stream, env, &object_key)
                .await?;
            Body::from_stream(plaintext)
        }
        // Object predates the proxy: relay bytes untouched.
        None => Body::from_stream(ciphertext_stream),
    };

    Ok((StatusCode::OK, response_headers, body).into_response())
}

/// HEAD object handler
/// HEAD /{bucket}/{key}
///
/// Served locally rather than forwarded: the client-facing metadata must
/// not leak `s3ep-*` fields and Content-Length must be the plaintext length.
#[instrument(skip(state))]
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
) -> Result<Response, S3Error> {
    info!("HEAD {}/{}", bucket, key);

    let head = state.store.head_object(&bucket, &key).await?;
    let envelope = envmeta::decode_envelope(&head.metadata)?;
    let headers = build_object_headers(&head, envelope.as_ref());
    Ok((StatusCode::OK, headers).into_response())
}

/// DELETE object handler
/// DELETE /{bucket}/{key}
/// DELETE /{bucket}/{key}?uploadId=X - AbortMultipartUpload
#[instrument(skip(state, headers))]
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    // AbortMultipartUpload
    if let Some(upload_id) = &query.upload_id {
        info!(
            "AbortMultipartUpload {}/{} uploadId={}",
            bucket, key, upload_id
        );
        state.multipart.abort(upload_id, &bucket, &key).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    // Deletion carries no payload; relay it (and its response) verbatim.
    debug!("DELETE {}/{} (pass-through)", bucket, key);
    super::passthrough::forward_request(
        &state,
        Method::DELETE,
        &format!("/{bucket}/{key}"),
        raw_query.as_deref().unwrap_or(""),
        &headers,
        Body::empty(),
    )
    .await
    .map_err(|e| {
        warn!("DELETE {}/{} forward failed: {}", bucket, key, e);
        e
    })
}
