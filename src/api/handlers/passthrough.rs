//! Verbatim pass-through handlers.
//!
//! Every S3 verb the data path and the multipart coordinator do not
//! terminate lands here: bucket CRUD, listings, ACLs, policies, tagging,
//! lifecycle, website, CORS, location, logging, and the long tail. The
//! request is relayed with its body re-framed only when it arrived
//! AWS-chunked, re-signed with the upstream credentials, and the response
//! is relayed unchanged — including non-`s3ep-*` metadata, which is never
//! rewritten or stripped on these paths.

use super::{AppState, S3Error};
use crate::api::aws_chunked::{decode_aws_chunked, get_decoded_content_length, is_aws_chunked};
use crate::api::xml::ListMultipartUploadsResult;
use crate::multipart::UploadInfo;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Relay one request to the upstream. The body must already be fully read;
/// AWS-chunked framing is stripped before signing so the upstream sees the
/// payload the client actually sent.
pub(super) async fn forward_request(
    state: &Arc<AppState>,
    method: Method,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let raw = axum::body::to_bytes(body, state.max_object_size as usize)
        .await
        .map_err(|e| S3Error::MalformedRequest(format!("cannot read request body: {e}")))?;

    let payload = if is_aws_chunked(headers) {
        let expected = get_decoded_content_length(headers);
        decode_aws_chunked(&raw, expected)
            .map_err(|e| S3Error::MalformedRequest(e.to_string()))?
    } else {
        raw
    };

    let response = state
        .forwarder
        .forward(method, path, query, headers, payload)
        .await
        .map_err(S3Error::from)?;
    Ok(response)
}

/// Query parameters for bucket-level GET operations we intercept.
#[derive(Debug, Deserialize, Default)]
pub struct BucketQuery {
    /// ListMultipartUploads marker — upload state lives in the proxy, not
    /// upstream, so this one bucket subresource cannot be forwarded.
    pub uploads: Option<String>,
    pub prefix: Option<String>,
}

/// Bucket-level handler: serves ListMultipartUploads locally, forwards
/// everything else verbatim.
#[instrument(skip(state, headers, body))]
pub async fn bucket_handler(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let query = raw_query.as_deref().unwrap_or("");

    if method == Method::GET {
        let parsed: BucketQuery = serde_urlencoded_from_query(query);
        if parsed.uploads.is_some() {
            debug!("ListMultipartUploads {}", bucket);
            let uploads: Vec<UploadInfo> = state
                .multipart
                .list_uploads(Some(&bucket), parsed.prefix.as_deref())
                .await;
            let result = ListMultipartUploadsResult {
                bucket: bucket.clone(),
                prefix: parsed.prefix.unwrap_or_default(),
                uploads,
                max_uploads: 1000,
                is_truncated: false,
            };
            return Ok((
                StatusCode::OK,
                [("Content-Type", "application/xml")],
                result.to_xml(),
            )
                .into_response());
        }
    }

    forward_request(&state, method, &format!("/{bucket}"), query, &headers, body).await
}

/// Root handler: ListBuckets and client connection probes, forwarded.
#[instrument(skip(state, headers, body))]
pub async fn root_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    forward_request(
        &state,
        method,
        "/",
        raw_query.as_deref().unwrap_or(""),
        &headers,
        body,
    )
    .await
}

/// Catch-all for anything the router did not match.
#[instrument(skip(state, request))]
pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<Body>,
) -> Result<Response, S3Error> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();
    let headers = request.headers().clone();
    let body = request.into_body();

    debug!("Pass-through fallback: {} {}", method, path);
    forward_request(&state, method.clone(), &path, &query, &headers, body)
        .await
        .map_err(|e| {
            warn!("Pass-through {} {} failed: {}", method, path, e);
            e
        })
}

/// Parse a raw query string into `BucketQuery` without failing: bare keys
/// (`?uploads`) are the common case for S3 subresources.
fn serde_urlencoded_from_query(query: &str) -> BucketQuery {
    let mut out = BucketQuery::default();
    for pair in query.split('&').filter(|s| !s.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        match k {
            "uploads" => out.uploads = Some(v.to_string()),
            "prefix" => out.prefix = Some(urlencoding::decode(v).unwrap_or_default().into_owned()),
            _ => {}
        }
    }
    out
}
