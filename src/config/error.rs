//! Configuration error types

use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Errors that can occur during configuration validation
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Outbound queue capacity must be at least 1")]
    InvalidQueueCapacity,

    #[error("Maximum message size is too small for protocol frames")]
    MaxMessageSizeTooSmall,

    #[error("Signing key is not valid base64")]
    InvalidSigningKeyEncoding,

    #[error("Signing key must be at least 32 bytes")]
    SigningKeyTooShort,
}
