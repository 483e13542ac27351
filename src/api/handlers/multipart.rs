//! Multipart upload lifecycle handlers.
//!
//! POST /{bucket}/{key}?uploads   - CreateMultipartUpload
//! POST /{bucket}/{key}?uploadId  - CompleteMultipartUpload
//!
//! UploadPart rides the PUT handler (`?partNumber&uploadId`) and Abort rides
//! DELETE; ListParts rides GET. The coordinator always encrypts multipart
//! payloads with CTR so parts can start at independent keystream offsets.

use super::{extract_user_metadata, AppState, ObjectQuery, S3Error};
use crate::api::extractors::ValidatedPath;
use crate::api::xml::{
    CompleteMultipartUploadRequest, CompleteMultipartUploadResult, InitiateMultipartUploadResult,
};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// POST object handler for multipart upload operations
#[instrument(skip(state, headers, body))]
pub async fn post_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    // CreateMultipartUpload
    if query.uploads.is_some() {
        info!("CreateMultipartUpload {}/{}", bucket, key);
        let _ticket = state.ticket()?;

        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let user_metadata = extract_user_metadata(&headers)?;

        let object_key = format!("{bucket}/{key}");
        let crypto = state.engine.begin_multipart(&object_key).await?;
        let upload_id = state
            .multipart
            .create(&bucket, &key, content_type, user_metadata, crypto)
            .await?;

        let result = InitiateMultipartUploadResult {
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id,
        };
        return Ok((
            StatusCode::OK,
            [("Content-Type", "application/xml")],
            result.to_xml(),
        )
            .into_response());
    }

    // CompleteMultipartUpload
    if let Some(upload_id) = &query.upload_id {
        info!(
            "CompleteMultipartUpload {}/{} uploadId={}",
            bucket, key, upload_id
        );
        let _ticket = state.ticket()?;

        let body_str = std::str::from_utf8(&body).map_err(|_| S3Error::MalformedXML)?;
        let complete_req = CompleteMultipartUploadRequest::from_xml(body_str).map_err(|e| {
            warn!("Failed to parse CompleteMultipartUpload XML: {}", e);
            S3Error::MalformedXML
        })?;

        let requested_parts: Vec<(u32, String)> = complete_req
            .parts
            .iter()
            .map(|p| (p.part_number, p.etag.clone()))
            .collect();

        let (etag, _envelope) = state
            .multipart
            .complete(upload_id, &bucket, &key, &requested_parts)
            .await?;

        let result = CompleteMultipartUploadResult {
            location: format!("/{bucket}/{key}"),
            bucket: bucket.clone(),
            key: key.clone(),
            etag,
        };
        return Ok((
            StatusCode::OK,
            [("Content-Type", "application/xml")],
            result.to_xml(),
        )
            .into_response());
    }

    Err(S3Error::MalformedRequest(
        "POST on object requires ?uploads or ?uploadId parameter".to_string(),
    ))
}
