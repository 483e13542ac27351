//! Upstream object-store access: the SigV4-signed data-path client and the
//! verbatim pass-through forwarder.

mod forward;
pub mod sign;
mod store;

pub use forward::Forwarder;
pub use store::{ObjectBody, ObjectHead, ObjectStore, S3Upstream};

use thiserror::Error;

/// Errors from the upstream store. No retries happen at this layer; clients
/// own retry policy.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("No such upload: {0}")]
    NoSuchUpload(String),

    /// Upstream answered with an error we relay as-is.
    #[error("Upstream error {status}: {code}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    /// Upstream could not be reached (connect/timeout/TLS).
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream error: {0}")]
    Other(String),
}
