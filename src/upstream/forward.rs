//! Verbatim pass-through forwarding.
//!
//! Requests for S3 verbs the data path does not terminate (bucket CRUD,
//! listings, ACLs, tagging, lifecycle, and the rest of the surface) are
//! relayed to the upstream byte-for-byte: same method, path, query, and
//! body, with only the SigV4 signature replaced and AWS-chunked framing
//! already stripped by the caller. The upstream response — including error
//! bodies — is relayed back unchanged.

use super::sign::{self, SigningContext};
use super::UpstreamError;
use crate::config::UpstreamConfig;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::TryStreamExt;
use tracing::debug;

/// Request headers never relayed upstream: authentication is replaced, and
/// framing/connection headers are owned by the HTTP stacks on each side.
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "host",
    "content-length",
    "connection",
    "expect",
    "transfer-encoding",
    "x-amz-date",
    "x-amz-content-sha256",
    "x-amz-security-token",
    "x-amz-decoded-content-length",
];

/// Response headers owned by the local HTTP stack rather than relayed.
const SKIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Forwarder {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    host_header: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
}

impl Forwarder {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let endpoint: reqwest::Url = config
            .endpoint
            .parse()
            .map_err(|e| UpstreamError::Other(format!("invalid upstream endpoint: {e}")))?;

        let host = endpoint
            .host_str()
            .ok_or_else(|| UpstreamError::Other("upstream endpoint has no host".to_string()))?;
        let host_header = match endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| UpstreamError::Other(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            host_header,
            region: config.region.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
        })
    }

    /// Forward a request and relay the upstream response unchanged.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, UpstreamError> {
        let mut url = self.endpoint.clone();
        url.set_path(path);
        url.set_query(if query.is_empty() { None } else { Some(query) });

        // Relay everything except auth/framing headers; every forwarded
        // x-amz-* header must also be signed.
        let mut forwarded: Vec<(String, String)> = Vec::new();
        for (name, value) in headers {
            let name_str = name.as_str();
            if SKIP_REQUEST_HEADERS.contains(&name_str) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                forwarded.push((name_str.to_string(), v.to_string()));
            }
        }

        let mut signed_headers: Vec<(String, String)> = forwarded
            .iter()
            .filter(|(name, _)| name.starts_with("x-amz-"))
            .cloned()
            .collect();
        signed_headers.push(("host".to_string(), self.host_header.clone()));

        let content_sha256 = sign::payload_hash(&body);
        let ctx = SigningContext {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            region: &self.region,
            service: "s3",
        };
        let signed = sign::sign_request(
            &ctx,
            method.as_str(),
            path,
            query,
            &signed_headers,
            &content_sha256,
            chrono::Utc::now(),
        );

        let mut request = self
            .http
            .request(method.clone(), url)
            .header("authorization", &signed.authorization)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.content_sha256)
            .body(body);
        for (name, value) in &forwarded {
            request = request.header(name, value);
        }

        let upstream = request
            .send()
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        debug!("Pass-through {} {} -> {}", method, path, status);

        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.insert(n, v);
            }
        }

        let stream = upstream
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}
