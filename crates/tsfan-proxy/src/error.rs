//! Proxy error type.

use thiserror::Error;

/// Convenience alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Everything that can take the proxy down.
///
/// Malformed messages and channel mismatches are deliberately absent: the
/// consumer logs and skips those without leaving its loop.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A mandatory configuration key is missing.
    #[error("config option \"{0}\" not provided")]
    MissingOption(&'static str),

    /// A configuration value is present but invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The configuration file is not valid YAML.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A downstream timeseries operation failed.
    #[error(transparent)]
    Timeseries(#[from] tsfan::Error),

    /// The Kafka consumer failed.
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}
