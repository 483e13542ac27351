//! s3ep — transparent envelope-encrypting proxy for S3-compatible object stores
//!
//! This library provides the core functionality for the s3ep proxy: the S3
//! request router, the envelope-encryption engine, the streaming multipart
//! coordinator, and the SigV4-signed upstream client.

pub mod api;
pub mod config;
pub mod crypto;
pub mod license;
pub mod multipart;
pub mod shutdown;
pub mod upstream;
