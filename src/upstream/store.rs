//! Data-path upstream client over the AWS SDK.
//!
//! The trait keeps the surface at exactly the operations the data path and
//! the multipart coordinator need; everything else goes through the verbatim
//! forwarder. Object-safe so tests can swap in an in-memory store.

use super::UpstreamError;
use crate::config::UpstreamConfig;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::debug;

/// Object metadata as seen on the upstream store.
#[derive(Debug, Clone, Default)]
pub struct ObjectHead {
    /// Stored (ciphertext) length.
    pub content_length: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    /// Bare-key user metadata (no `x-amz-meta-` prefix).
    pub metadata: HashMap<String, String>,
}

/// A streamed object body plus its head.
pub struct ObjectBody {
    pub head: ObjectHead,
    pub stream: BoxStream<'static, Result<Bytes, UpstreamError>>,
}

/// The upstream operations the encrypting data path relies on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a complete object with its user metadata in one atomic request.
    /// Returns the upstream ETag.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, UpstreamError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, UpstreamError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, UpstreamError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), UpstreamError>;

    /// Begin a multipart upload; metadata supplied here lands on the final
    /// object at completion. Returns the upstream upload id.
    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, UpstreamError>;

    /// Upload one (ciphertext) part. Returns the upstream part ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, UpstreamError>;

    /// Seal a multipart upload from `(part_number, etag)` pairs. Returns the
    /// final object ETag.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<String, UpstreamError>;

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), UpstreamError>;

    /// Replace an object's user metadata in place (CopyObject onto itself
    /// with the REPLACE directive). Used to attach the envelope after a
    /// multipart completion, when the HMAC is finally known.
    async fn replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<(), UpstreamError>;
}

/// `ObjectStore` implementation over aws-sdk-s3.
pub struct S3Upstream {
    client: Client,
}

impl S3Upstream {
    /// Build the SDK client from configuration. Credentials are explicit;
    /// there is no default-chain fallback because the proxy must never sign
    /// with ambient instance credentials by accident.
    pub fn new(config: &UpstreamConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "s3ep-config",
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(&config.endpoint)
            .force_path_style(config.force_path_style)
            .build();

        let client = Client::from_conf(s3_config);
        debug!("S3 upstream initialized for endpoint {}", config.endpoint);

        Self { client }
    }

    fn map_sdk_error<E>(err: SdkError<E>, context: &str) -> UpstreamError
    where
        E: aws_sdk_s3::error::ProvideErrorMetadata + std::fmt::Debug,
    {
        match &err {
            SdkError::ServiceError(service_error) => {
                let meta = aws_sdk_s3::error::ProvideErrorMetadata::meta(service_error.err());
                let code = meta.code().unwrap_or("UpstreamError").to_string();
                let message = meta.message().unwrap_or(context).to_string();
                let status = service_error.raw().status().as_u16();
                match code.as_str() {
                    "NoSuchKey" | "NotFound" => UpstreamError::NotFound(message),
                    "NoSuchUpload" => UpstreamError::NoSuchUpload(message),
                    _ => UpstreamError::Service {
                        status,
                        code,
                        message,
                    },
                }
            }
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
                UpstreamError::Unavailable(format!("{context}: {err}"))
            }
            _ => UpstreamError::Other(format!("{context}: {err}")),
        }
    }
}

fn to_head(
    content_length: Option<i64>,
    content_type: Option<String>,
    etag: Option<String>,
    last_modified: Option<aws_sdk_s3::primitives::DateTime>,
    metadata: Option<HashMap<String, String>>,
) -> ObjectHead {
    ObjectHead {
        content_length: content_length.unwrap_or(0).max(0) as u64,
        content_type,
        etag,
        last_modified: last_modified.and_then(|dt| {
            chrono::DateTime::<chrono::Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
        }),
        metadata: metadata.unwrap_or_default(),
    }
}

fn body_stream(body: ByteStream) -> BoxStream<'static, Result<Bytes, UpstreamError>> {
    // 64 KiB read chunks: large enough to amortize syscalls, small enough to
    // keep per-request memory flat.
    tokio_util::io::ReaderStream::with_capacity(body.into_async_read(), 64 * 1024)
        .map_err(|e| UpstreamError::Other(format!("body read failed: {e}")))
        .boxed()
}

#[async_trait]
impl ObjectStore for S3Upstream {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, UpstreamError> {
        let len = data.len();
        let response = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type)
            .set_metadata(Some(metadata))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "put_object failed"))?;

        debug!("S3 PUT {}/{} ({} bytes)", bucket, key, len);
        Ok(response.e_tag().unwrap_or_default().to_string())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, UpstreamError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "get_object failed"))?;

        let head = to_head(
            response.content_length,
            response.content_type.clone(),
            response.e_tag.clone(),
            response.last_modified,
            response.metadata.clone(),
        );
        debug!("S3 GET {}/{} ({} bytes)", bucket, key, head.content_length);
        Ok(ObjectBody {
            head,
            stream: body_stream(response.body),
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, UpstreamError> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "head_object failed"))?;

        Ok(to_head(
            response.content_length,
            response.content_type,
            response.e_tag,
            response.last_modified,
            response.metadata,
        ))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), UpstreamError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "delete_object failed"))?;

        debug!("S3 DELETE {}/{}", bucket, key);
        Ok(())
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, UpstreamError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "create_multipart_upload failed"))?;

        response
            .upload_id
            .ok_or_else(|| UpstreamError::Other("upstream returned no upload id".to_string()))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, UpstreamError> {
        let len = data.len();
        let response = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "upload_part failed"))?;

        debug!(
            "S3 UploadPart {}/{} part={} ({} bytes)",
            bucket, key, part_number, len
        );
        Ok(response.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<String, UpstreamError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|(number, etag)| {
                        CompletedPart::builder()
                            .part_number(*number as i32)
                            .e_tag(etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "complete_multipart_upload failed"))?;

        Ok(response.e_tag().unwrap_or_default().to_string())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), UpstreamError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "abort_multipart_upload failed"))?;
        Ok(())
    }

    async fn replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<(), UpstreamError> {
        let copy_source = format!(
            "{}/{}",
            bucket,
            urlencoding::encode(key).replace("%2F", "/")
        );
        self.client
            .copy_object()
            .bucket(bucket)
            .key(key)
            .copy_source(copy_source)
            .metadata_directive(MetadataDirective::Replace)
            .set_content_type(content_type)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "copy_object (metadata replace) failed"))?;

        debug!("S3 metadata replace {}/{}", bucket, key);
        Ok(())
    }
}
