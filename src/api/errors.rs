//! S3 error types and XML responses.
//!
//! User-visible failures keep the S3 XML error envelope so SDK clients
//! parse them normally. Upstream errors relayed from pass-through paths
//! bypass this type entirely; data-path upstream failures are wrapped here
//! with the failing phase but never with key material.

use crate::crypto::CryptoError;
use crate::multipart::MultipartError;
use crate::upstream::UpstreamError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// S3 API errors
#[derive(Debug, Error)]
pub enum S3Error {
    #[error("MalformedRequest: {0}")]
    MalformedRequest(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("MalformedXML: The XML you provided was not well-formed.")]
    MalformedXML,

    #[error("AccessDenied: Access Denied")]
    AccessDenied(String),

    #[error("NoSuchKey: The specified key does not exist.")]
    NoSuchKey(String),

    #[error("NoSuchUpload: The specified multipart upload does not exist.")]
    NoSuchUpload(String),

    #[error("InvalidPart: {0}")]
    InvalidPart(String),

    #[error("InvalidPartOrder: {0}")]
    InvalidPartOrder(String),

    #[error("EntityTooLarge: Your proposed upload exceeds the maximum allowed size.")]
    EntityTooLarge { size: u64, max: u64 },

    #[error("InternalError: We encountered an internal error. Please try again.")]
    InternalError(String),

    /// HMAC or AEAD verification failed on read.
    #[error("InternalError: Stored object failed integrity verification.")]
    IntegrityFailure,

    #[error("ServiceUnavailable: {0}")]
    ServiceUnavailable(String),

    #[error("NotImplemented: {0}")]
    NotImplemented(String),

    /// The license gate refused the configured encryption provider.
    #[error("EncryptionNotLicensed: {0}")]
    LicenseRestriction(String),

    /// Proxy is draining; no new data-path requests.
    #[error("ServiceUnavailable: The proxy is shutting down.")]
    ShuttingDown,

    /// An upstream error relayed with its original status and code.
    #[error("{code}: {message}")]
    Upstream {
        status: u16,
        code: String,
        message: String,
    },
}

impl S3Error {
    /// Get the S3 error code
    pub fn code(&self) -> &str {
        match self {
            S3Error::MalformedRequest(_) => "MalformedRequest",
            S3Error::InvalidArgument(_) => "InvalidArgument",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::AccessDenied(_) => "AccessDenied",
            S3Error::NoSuchKey(_) => "NoSuchKey",
            S3Error::NoSuchUpload(_) => "NoSuchUpload",
            S3Error::InvalidPart(_) => "InvalidPart",
            S3Error::InvalidPartOrder(_) => "InvalidPartOrder",
            S3Error::EntityTooLarge { .. } => "EntityTooLarge",
            S3Error::InternalError(_) => "InternalError",
            S3Error::IntegrityFailure => "InternalError",
            S3Error::ServiceUnavailable(_) => "ServiceUnavailable",
            S3Error::NotImplemented(_) => "NotImplemented",
            S3Error::LicenseRestriction(_) => "EncryptionNotLicensed",
            S3Error::ShuttingDown => "ServiceUnavailable",
            S3Error::Upstream { code, .. } => code,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            S3Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::AccessDenied(_) => StatusCode::FORBIDDEN,
            S3Error::NoSuchKey(_) => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload(_) => StatusCode::NOT_FOUND,
            S3Error::InvalidPart(_) => StatusCode::BAD_REQUEST,
            S3Error::InvalidPartOrder(_) => StatusCode::BAD_REQUEST,
            S3Error::EntityTooLarge { .. } => StatusCode::BAD_REQUEST,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            S3Error::IntegrityFailure => StatusCode::INTERNAL_SERVER_ERROR,
            S3Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            S3Error::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            S3Error::LicenseRestriction(_) => StatusCode::FORBIDDEN,
            S3Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            S3Error::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Generate XML error response
    pub fn to_xml(&self) -> String {
        let resource = match self {
            S3Error::NoSuchKey(key) => key.clone(),
            S3Error::NoSuchUpload(id) => id.clone(),
            _ => String::new(),
        };

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
    <Code>{}</Code>
    <Message>{}</Message>
    <Resource>{}</Resource>
    <RequestId>{}</RequestId>
</Error>"#,
            self.code(),
            crate::api::xml::escape_xml(&self.to_string()),
            crate::api::xml::escape_xml(&resource),
            uuid::Uuid::new_v4()
        )
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_xml();

        (status, [("Content-Type", "application/xml")], body).into_response()
    }
}

impl From<CryptoError> for S3Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyNotFound { provider, fingerprint } => S3Error::AccessDenied(format!(
                "no loaded key for provider '{provider}' fingerprint {fingerprint}"
            )),
            CryptoError::InvalidKey(msg) => S3Error::AccessDenied(msg),
            CryptoError::UnwrapFailed(msg) => S3Error::AccessDenied(msg),
            CryptoError::IntegrityFailure => S3Error::IntegrityFailure,
            CryptoError::KmsUnavailable(msg) => S3Error::ServiceUnavailable(msg),
            CryptoError::InvalidEnvelope(msg) => {
                S3Error::InternalError(format!("stored envelope unreadable: {msg}"))
            }
            CryptoError::LicenseRestriction(kind) => S3Error::LicenseRestriction(format!(
                "provider type '{kind}' is not permitted by the installed license"
            )),
            CryptoError::WrapFailed(msg) => S3Error::InternalError(msg),
            CryptoError::Stream(msg) => S3Error::InternalError(msg),
        }
    }
}

impl From<UpstreamError> for S3Error {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotFound(key) => S3Error::NoSuchKey(key),
            UpstreamError::NoSuchUpload(id) => S3Error::NoSuchUpload(id),
            UpstreamError::Service {
                status,
                code,
                message,
            } => S3Error::Upstream {
                status,
                code,
                message,
            },
            UpstreamError::Unavailable(msg) => S3Error::ServiceUnavailable(msg),
            UpstreamError::Other(msg) => S3Error::InternalError(msg),
        }
    }
}

impl From<MultipartError> for S3Error {
    fn from(err: MultipartError) -> Self {
        match err {
            MultipartError::NoSuchUpload(id) => S3Error::NoSuchUpload(id),
            MultipartError::InvalidPartNumber(n) => {
                S3Error::InvalidArgument(format!("Part number must be between 1 and 10000, got {n}"))
            }
            MultipartError::InvalidPart(msg) => S3Error::InvalidPart(msg),
            MultipartError::PartSealed { part } => S3Error::InvalidPartOrder(format!(
                "Part {part} was already finalized and cannot be replaced"
            )),
            MultipartError::PendingOverflow => S3Error::InvalidPartOrder(
                "Too many out-of-order parts in flight; upload failed".to_string(),
            ),
            MultipartError::NotCompletable(msg) => S3Error::InvalidPart(msg),
            MultipartError::Crypto(e) => e.into(),
            MultipartError::Upstream(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_statuses() {
        assert_eq!(
            S3Error::MalformedRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            S3Error::AccessDenied("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            S3Error::IntegrityFailure.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(S3Error::IntegrityFailure.code(), "InternalError");
        assert_eq!(
            S3Error::NoSuchUpload("u".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            S3Error::LicenseRestriction("aes".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            S3Error::LicenseRestriction("aes".into()).code(),
            "EncryptionNotLicensed"
        );
        assert_eq!(
            S3Error::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_upstream_error_relays_status() {
        let err = S3Error::Upstream {
            status: 409,
            code: "BucketNotEmpty".to_string(),
            message: "not empty".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "BucketNotEmpty");
    }

    #[test]
    fn test_xml_body_shape() {
        let xml = S3Error::NoSuchKey("bucket/missing.bin".to_string()).to_xml();
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Resource>bucket/missing.bin</Resource>"));
        assert!(xml.contains("<RequestId>"));
    }

    #[test]
    fn test_key_not_found_maps_to_access_denied() {
        let err: S3Error = CryptoError::KeyNotFound {
            provider: "aes".to_string(),
            fingerprint: "0011".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "AccessDenied");
    }
}
