//! Configuration for the s3ep proxy.

use crate::crypto::ProviderKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// Default streaming threshold: objects at or above this size use CTR+HMAC.
pub const DEFAULT_STREAMING_THRESHOLD: u64 = 12 * 1024 * 1024;
/// Default multipart part size expected from well-behaved clients.
pub const DEFAULT_MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Upstream S3-compatible object store
    pub upstream: UpstreamConfig,

    /// Envelope-encryption settings
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Seconds to wait for in-flight requests during shutdown before
    /// dropping them
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// Log level: trace|debug|info|warn|error (overridden by RUST_LOG and
    /// S3EP_LOG_LEVEL)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Permitted encryption provider types, supplied by the license
    /// collaborator at deploy time. Absent means unrestricted.
    #[serde(default)]
    pub license: Option<LicenseConfig>,

    /// Maximum request body size accepted on the data path
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,

    /// Domain suffix for virtual-hosted-style addressing
    /// (`bucket.s3.example.com`). Path-style requests are always accepted.
    #[serde(default)]
    pub virtual_host_suffix: Option<String>,
}

/// Upstream endpoint and credentials. Forwarded requests are re-signed with
/// these credentials; the client's own SigV4 is validated by the ambient
/// auth layer in front of the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Endpoint URL (e.g. `http://minio:9000` or an AWS regional endpoint)
    pub endpoint: String,

    /// AWS region used in SigV4 signatures
    #[serde(default = "default_region")]
    pub region: String,

    pub access_key_id: String,
    pub secret_access_key: String,

    /// Use path-style URLs (required for MinIO, LocalStack)
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,

    /// Verify the upstream TLS certificate. Applies to the pass-through
    /// forwarder; the SDK data path always verifies.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

/// Envelope-encryption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Alias of the provider used for new writes. Every loaded provider may
    /// service reads matching its fingerprint.
    #[serde(default = "default_active_alias")]
    pub active_alias: String,

    /// Loaded KEK providers, keyed by alias
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    /// Objects at or above this size use streaming CTR+HMAC instead of GCM
    #[serde(default = "default_streaming_threshold")]
    pub streaming_threshold_bytes: u64,

    /// Part size well-behaved multipart clients are expected to use for
    /// interior parts; out-of-order parts are placed at offsets derived
    /// from it
    #[serde(default = "default_multipart_part_size")]
    pub multipart_part_size_bytes: u64,
}

/// One KEK provider entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// 256-bit symmetric KEK held in process memory
    Aes {
        alias: String,
        /// Standard base64 of the 32 raw key bytes
        key_base64: String,
    },

    /// RSA-OAEP(SHA-256) KEK from PEM files; private half optional
    /// (write-only deployments)
    Rsa {
        alias: String,
        public_key_path: String,
        #[serde(default)]
        private_key_path: Option<String>,
    },

    /// KMS-delegated KEK; wrap/unwrap never leave the KMS
    Tink {
        alias: String,
        key_uri: String,
        endpoint: String,
    },

    /// Identity provider: objects relay unencrypted
    None { alias: String },
}

impl ProviderConfig {
    pub fn alias(&self) -> &str {
        match self {
            ProviderConfig::Aes { alias, .. } => alias,
            ProviderConfig::Rsa { alias, .. } => alias,
            ProviderConfig::Tink { alias, .. } => alias,
            ProviderConfig::None { alias } => alias,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Aes { .. } => ProviderKind::Aes,
            ProviderConfig::Rsa { .. } => ProviderKind::Rsa,
            ProviderConfig::Tink { .. } => ProviderKind::Tink,
            ProviderConfig::None { .. } => ProviderKind::None,
        }
    }
}

/// License-gate input: the provider types this deployment may activate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    pub permitted_provider_types: Vec<ProviderKind>,
}

// Default value functions for serde
fn default_bind_address() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_verify_tls() -> bool {
    true
}

fn default_active_alias() -> String {
    "default".to_string()
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![ProviderConfig::None {
        alias: "default".to_string(),
    }]
}

fn default_streaming_threshold() -> u64 {
    DEFAULT_STREAMING_THRESHOLD
}

fn default_multipart_part_size() -> u64 {
    DEFAULT_MULTIPART_PART_SIZE
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_object_size() -> u64 {
    100 * 1024 * 1024 // 100MB
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            active_alias: default_active_alias(),
            providers: default_providers(),
            streaming_threshold_bytes: default_streaming_threshold(),
            multipart_part_size_bytes: default_multipart_part_size(),
        }
    }
}

/// Configuration loading/validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables (container deployments)
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = std::env::var("S3EP_UPSTREAM_ENDPOINT")
            .map_err(|_| ConfigError::Invalid("S3EP_UPSTREAM_ENDPOINT is required".to_string()))?;

        let mut config = Self {
            bind_address: default_bind_address(),
            upstream: UpstreamConfig {
                endpoint,
                region: std::env::var("S3EP_UPSTREAM_REGION").unwrap_or_else(|_| default_region()),
                access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
                secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
                force_path_style: std::env::var("S3EP_UPSTREAM_FORCE_PATH_STYLE")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
                verify_tls: std::env::var("S3EP_UPSTREAM_VERIFY_TLS")
                    .map(|v| v != "false" && v != "0")
                    .unwrap_or(true),
            },
            encryption: EncryptionConfig::default(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            log_level: default_log_level(),
            license: None,
            max_object_size: default_max_object_size(),
            virtual_host_suffix: std::env::var("S3EP_VIRTUAL_HOST_SUFFIX").ok(),
        };

        if let Ok(addr) = std::env::var("S3EP_BIND_ADDRESS") {
            config.bind_address = addr
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid S3EP_BIND_ADDRESS: {addr}")))?;
        }
        if let Ok(alias) = std::env::var("S3EP_ACTIVE_ALIAS") {
            config.encryption.active_alias = alias;
        }
        if let Ok(key) = std::env::var("S3EP_AES_KEY_BASE64") {
            config.encryption.providers = vec![ProviderConfig::Aes {
                alias: config.encryption.active_alias.clone(),
                key_base64: key,
            }];
        }
        if let Ok(v) = std::env::var("S3EP_STREAMING_THRESHOLD_BYTES") {
            config.encryption.streaming_threshold_bytes = v.parse().map_err(|_| {
                ConfigError::Invalid(format!("invalid S3EP_STREAMING_THRESHOLD_BYTES: {v}"))
            })?;
        }
        if let Ok(v) = std::env::var("S3EP_SHUTDOWN_TIMEOUT_SECONDS") {
            config.shutdown_timeout_seconds = v.parse().map_err(|_| {
                ConfigError::Invalid(format!("invalid S3EP_SHUTDOWN_TIMEOUT_SECONDS: {v}"))
            })?;
        }
        if let Ok(v) = std::env::var("S3EP_LOG_LEVEL") {
            config.log_level = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Structural checks that must hold before any provider loads key material.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let enc = &self.encryption;
        if enc.providers.is_empty() {
            return Err(ConfigError::Invalid(
                "encryption.providers must not be empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &enc.providers {
            if p.alias().is_empty() {
                return Err(ConfigError::Invalid(
                    "provider alias must not be empty".to_string(),
                ));
            }
            if !seen.insert(p.alias().to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider alias '{}'",
                    p.alias()
                )));
            }
        }
        if !seen.contains(&enc.active_alias) {
            return Err(ConfigError::Invalid(format!(
                "active_alias '{}' does not name a configured provider",
                enc.active_alias
            )));
        }
        if enc.streaming_threshold_bytes == 0 {
            return Err(ConfigError::Invalid(
                "streaming_threshold_bytes must be positive".to_string(),
            ));
        }
        if enc.multipart_part_size_bytes == 0 || enc.multipart_part_size_bytes % 16 != 0 {
            return Err(ConfigError::Invalid(
                "multipart_part_size_bytes must be a positive multiple of 16".to_string(),
            ));
        }
        if self.upstream.endpoint.is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.endpoint must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
            bind_address = "127.0.0.1:9000"

            [upstream]
            endpoint = "http://localhost:9001"
            access_key_id = "AKID"
            secret_access_key = "SECRET"

            [encryption]
            active_alias = "k1"

            [[encryption.providers]]
            type = "aes"
            alias = "k1"
            key_base64 = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
        "#
        .to_string()
    }

    #[test]
    fn test_parse_minimal() {
        let config: Config = toml::from_str(&base_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.encryption.active_alias, "k1");
        assert_eq!(
            config.encryption.streaming_threshold_bytes,
            DEFAULT_STREAMING_THRESHOLD
        );
        assert_eq!(config.shutdown_timeout_seconds, 30);
        assert!(config.upstream.force_path_style);
    }

    #[test]
    fn test_provider_variants_parse() {
        let toml_str = r#"
            [upstream]
            endpoint = "http://localhost:9001"
            access_key_id = "AKID"
            secret_access_key = "SECRET"

            [encryption]
            active_alias = "aws"

            [[encryption.providers]]
            type = "tink"
            alias = "aws"
            key_uri = "aws-kms://arn:aws:kms:us-east-1:123:key/abc"
            endpoint = "https://kms.internal"

            [[encryption.providers]]
            type = "rsa"
            alias = "escrow"
            public_key_path = "/keys/escrow.pub.pem"

            [[encryption.providers]]
            type = "none"
            alias = "open"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.encryption.providers.len(), 3);
        assert_eq!(config.encryption.providers[0].kind(), ProviderKind::Tink);
        assert_eq!(config.encryption.providers[1].kind(), ProviderKind::Rsa);
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let toml_str = base_toml()
            + r#"
            [[encryption.providers]]
            type = "none"
            alias = "k1"
        "#;
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_active_alias_rejected() {
        let mut config: Config = toml::from_str(&base_toml()).unwrap();
        config.encryption.active_alias = "ghost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unaligned_part_size_rejected() {
        let mut config: Config = toml::from_str(&base_toml()).unwrap();
        config.encryption.multipart_part_size_bytes = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_license_section() {
        let toml_str = base_toml()
            + r#"
            [license]
            permitted_provider_types = ["aes", "none"]
        "#;
        let config: Config = toml::from_str(&toml_str).unwrap();
        let license = config.license.unwrap();
        assert_eq!(
            license.permitted_provider_types,
            vec![ProviderKind::Aes, ProviderKind::None]
        );
    }
}
