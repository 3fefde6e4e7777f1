use std::net::AddrParseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationRejection),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Discovery source failure: {0}")]
    SourceFailure(String),
    #[error("Registry invariant violated: {0}")]
    RegistryInvariant(String),
    #[error("Invalid scan transition from {from} on {action}")]
    InvalidTransition { from: String, action: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
}

/// Why a single advertised field (or the whole advertisement) was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationRejection {
    #[error("invalid IP address '{0}'")]
    InvalidIp(String),
    #[error("host {0} is outside the configured network range")]
    OutOfRange(String),
    #[error("port {0} is outside 1..=65535")]
    InvalidPort(u32),
    #[error("invalid service type '{0}'")]
    InvalidServiceType(String),
    #[error("invalid metadata key '{0}'")]
    InvalidMetadataKey(String),
    #[error("metadata key '{0}' advertised more than once with different case")]
    AmbiguousMetadataKey(String),
    #[error("unsafe content in metadata value for key '{0}'")]
    UnsafeMetadataValue(String),
    #[error("metadata pair '{0}' exceeds the pair limit")]
    TooManyMetadataPairs(String),
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::SerializationError(err.to_string())
    }
}

impl From<AddrParseError> for DiscoveryError {
    fn from(err: AddrParseError) -> Self {
        DiscoveryError::NetworkError(err.to_string())
    }
}
