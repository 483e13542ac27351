//! S3 API implementation

pub mod aws_chunked;
mod errors;
mod extractors;
pub mod handlers;
pub mod xml;

pub use errors::S3Error;
pub use extractors::{ValidatedBucket, ValidatedPath};

use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;

/// Build the S3 router over shared application state. Layers (tracing,
/// CORS, virtual-host rewriting) are the binary's concern.
///
/// S3 API paths:
///   GET  /health          - local health endpoint (never routed upstream)
///   *    /                - ListBuckets and probes, forwarded
///   *    /{bucket}        - bucket subresources, forwarded (uploads listed locally)
///   GET  /{bucket}/{key}  - decrypting download / ListParts
///   PUT  /{bucket}/{key}  - encrypting upload / UploadPart / copy
///   POST /{bucket}/{key}  - multipart create/complete
///   HEAD /{bucket}/{key}  - envelope-stripped metadata
///   DEL  /{bucket}/{key}  - abort / forwarded delete
pub fn router(state: Arc<handlers::AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/", any(handlers::root_handler))
        .route(
            "/:bucket/*key",
            get(handlers::get_object)
                .put(handlers::put_object_or_copy)
                .delete(handlers::delete_object)
                .head(handlers::head_object)
                .post(handlers::post_object),
        )
        .route("/:bucket", any(handlers::bucket_handler))
        .route("/:bucket/", any(handlers::bucket_handler))
        .fallback(handlers::passthrough)
        .with_state(state)
}
