//! Custom Axum extractors for S3 API validation
//!
//! These extractors provide automatic validation of S3 request parameters,
//! eliminating repetitive validation code from handlers. The proxy is
//! multi-bucket: bucket existence is the upstream's call, but names and
//! keys are screened for encoding hazards before they reach a signer.

use super::errors::S3Error;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path},
    http::request::Parts,
};

/// Validated bucket extractor
#[derive(Debug, Clone)]
pub struct ValidatedBucket(pub String);

impl std::ops::Deref for ValidatedBucket {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ValidatedBucket
where
    S: Send + Sync,
{
    type Rejection = S3Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(bucket): Path<String> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| S3Error::InvalidArgument("Invalid bucket path".to_string()))?;

        validate_bucket_name(&bucket)?;
        Ok(ValidatedBucket(bucket))
    }
}

/// Validated bucket and key extractor: bucket name screened, key normalized
/// (no leading slashes) and checked for traversal/encoding hazards.
#[derive(Debug, Clone)]
pub struct ValidatedPath {
    pub bucket: String,
    pub key: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for ValidatedPath
where
    S: Send + Sync,
{
    type Rejection = S3Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path((bucket, key)): Path<(String, String)> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| S3Error::InvalidArgument("Invalid bucket/key path".to_string()))?;

        validate_bucket_name(&bucket)?;
        let key = key.trim_start_matches('/').to_string();
        validate_object_key(&key)?;

        Ok(ValidatedPath { bucket, key })
    }
}

/// Screen a bucket name: S3 naming is looser across compatible stores, so
/// only outright hazards are rejected here.
pub fn validate_bucket_name(bucket: &str) -> Result<(), S3Error> {
    if bucket.is_empty() {
        return Err(S3Error::InvalidArgument(
            "Bucket name cannot be empty".to_string(),
        ));
    }
    if bucket.contains('/') || bucket.contains('\\') || bucket.contains('\0') {
        return Err(S3Error::InvalidArgument(
            "Bucket name contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Screen an object key for NUL bytes, backslashes, and `..` segments.
pub fn validate_object_key(key: &str) -> Result<(), S3Error> {
    if key.is_empty() {
        return Err(S3Error::InvalidArgument(
            "Object key must not be empty".to_string(),
        ));
    }
    if key.contains('\0') {
        return Err(S3Error::InvalidArgument(
            "Key must not contain NUL bytes".to_string(),
        ));
    }
    if key.contains('\\') {
        return Err(S3Error::InvalidArgument(
            "Key must not contain backslashes".to_string(),
        ));
    }
    for segment in key.split('/') {
        if segment == ".." {
            return Err(S3Error::InvalidArgument(
                "Key must not contain '..' path segments".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bucket_name() {
        assert!(validate_bucket_name("my-bucket").is_ok());
        assert!(validate_bucket_name("").is_err());
        assert!(validate_bucket_name("a/b").is_err());
        assert!(validate_bucket_name("a\\b").is_err());
    }

    #[test]
    fn test_validate_object_key() {
        assert!(validate_object_key("releases/v1.0/app.zip").is_ok());
        assert!(validate_object_key("with spaces and ünicode").is_ok());
        assert!(validate_object_key("").is_err());
        assert!(validate_object_key("../../../etc/passwd").is_err());
        assert!(validate_object_key("a/../b").is_err());
        assert!(validate_object_key("path\\file").is_err());
        assert!(validate_object_key("path\0file").is_err());
    }
}
